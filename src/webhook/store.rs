//! Durable delivery log: append-only JSONL with state derived from replay.
//!
//! Dead-lettered deliveries are retained in the log indefinitely; nothing
//! is ever silently discarded.

use std::collections::HashMap;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::delivery::{
    DeliveryEvent, DeliveryEventKind, DeliveryStats, DeliveryStatus, WebhookDelivery,
};

/// Errors from the delivery store.
#[derive(Debug, Error)]
pub enum DeliveryStoreError {
    #[error("delivery not found: {0}")]
    NotFound(Uuid),

    #[error("delivery {id} is {status:?}, expected {expected:?}")]
    InvalidStatus {
        id: Uuid,
        status: DeliveryStatus,
        expected: DeliveryStatus,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// JSONL-backed delivery log.
pub struct DeliveryStore {
    log_path: PathBuf,
    writer: Mutex<()>,
}

impl DeliveryStore {
    pub fn new(log_path: PathBuf) -> Self {
        Self {
            log_path,
            writer: Mutex::new(()),
        }
    }

    /// Open a store, creating the parent directory if needed.
    pub async fn open(log_path: PathBuf) -> Result<Self, DeliveryStoreError> {
        if let Some(parent) = log_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        Ok(Self::new(log_path))
    }

    async fn append(&self, event: &DeliveryEvent) -> Result<(), DeliveryStoreError> {
        let _guard = self.writer.lock().await;

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;

        let json = serde_json::to_string(event)?;
        file.write_all(format!("{}\n", json).as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Replay the full log into current delivery state.
    pub async fn replay(&self) -> Result<HashMap<Uuid, WebhookDelivery>, DeliveryStoreError> {
        let mut deliveries = HashMap::new();

        if !self.log_path.exists() {
            return Ok(deliveries);
        }

        let file = File::open(&self.log_path).await?;
        let reader = BufReader::new(file);
        let mut lines = reader.lines();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: DeliveryEvent = serde_json::from_str(&line)?;
            apply_event(&mut deliveries, event);
        }

        Ok(deliveries)
    }

    /// Enqueue a delivery, due immediately.
    pub async fn enqueue(
        &self,
        target: &str,
        event_type: &str,
        payload: serde_json::Value,
    ) -> Result<Uuid, DeliveryStoreError> {
        let id = Uuid::new_v4();
        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::Enqueued {
                target: target.to_string(),
                event_type: event_type.to_string(),
                payload,
            },
        })
        .await?;

        Ok(id)
    }

    /// Deliveries ready for an attempt, oldest first.
    pub async fn due(
        &self,
        now: DateTime<Utc>,
    ) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let deliveries = self.replay().await?;
        let mut due: Vec<WebhookDelivery> = deliveries
            .into_values()
            .filter(|d| d.is_due(now))
            .collect();
        due.sort_by(|a, b| a.next_attempt_at.cmp(&b.next_attempt_at));
        Ok(due)
    }

    pub async fn record_failure(
        &self,
        id: Uuid,
        error: &str,
        latency_ms: Option<u64>,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::AttemptFailed {
                error: error.to_string(),
                latency_ms,
                next_attempt_at,
            },
        })
        .await
    }

    /// Push a delivery back without consuming an attempt.
    pub async fn record_deferred(
        &self,
        id: Uuid,
        next_attempt_at: DateTime<Utc>,
    ) -> Result<(), DeliveryStoreError> {
        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::Deferred { next_attempt_at },
        })
        .await
    }

    pub async fn record_delivered(
        &self,
        id: Uuid,
        status_code: u16,
        latency_ms: u64,
    ) -> Result<(), DeliveryStoreError> {
        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::Delivered {
                status_code,
                latency_ms,
            },
        })
        .await
    }

    pub async fn record_dead_lettered(
        &self,
        id: Uuid,
        error: &str,
        latency_ms: Option<u64>,
    ) -> Result<(), DeliveryStoreError> {
        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::DeadLettered {
                error: error.to_string(),
                latency_ms,
            },
        })
        .await
    }

    /// Re-enqueue a dead-letter with a fresh attempt budget. Only valid
    /// from the dead-lettered state.
    pub async fn replay_dead_letter(&self, id: Uuid) -> Result<(), DeliveryStoreError> {
        let deliveries = self.replay().await?;
        let delivery = deliveries
            .get(&id)
            .ok_or(DeliveryStoreError::NotFound(id))?;

        if delivery.status != DeliveryStatus::DeadLettered {
            return Err(DeliveryStoreError::InvalidStatus {
                id,
                status: delivery.status,
                expected: DeliveryStatus::DeadLettered,
            });
        }

        self.append(&DeliveryEvent {
            timestamp: Utc::now(),
            delivery_id: id,
            kind: DeliveryEventKind::Replayed,
        })
        .await
    }

    pub async fn get(&self, id: Uuid) -> Result<Option<WebhookDelivery>, DeliveryStoreError> {
        Ok(self.replay().await?.remove(&id))
    }

    /// All dead-lettered deliveries, oldest first.
    pub async fn dead_letters(&self) -> Result<Vec<WebhookDelivery>, DeliveryStoreError> {
        let deliveries = self.replay().await?;
        let mut dead: Vec<WebhookDelivery> = deliveries
            .into_values()
            .filter(|d| d.status == DeliveryStatus::DeadLettered)
            .collect();
        dead.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(dead)
    }

    pub async fn stats(&self) -> Result<DeliveryStats, DeliveryStoreError> {
        let deliveries = self.replay().await?;
        let mut stats = DeliveryStats::default();
        for delivery in deliveries.values() {
            match delivery.status {
                DeliveryStatus::Pending => stats.pending += 1,
                DeliveryStatus::Delivered => stats.delivered += 1,
                DeliveryStatus::DeadLettered => stats.dead_lettered += 1,
            }
        }
        Ok(stats)
    }
}

fn apply_event(deliveries: &mut HashMap<Uuid, WebhookDelivery>, event: DeliveryEvent) {
    match event.kind {
        DeliveryEventKind::Enqueued {
            target,
            event_type,
            payload,
        } => {
            deliveries.insert(
                event.delivery_id,
                WebhookDelivery {
                    id: event.delivery_id,
                    target,
                    event_type,
                    payload,
                    created_at: event.timestamp,
                    status: DeliveryStatus::Pending,
                    attempts: 0,
                    next_attempt_at: event.timestamp,
                    last_error: None,
                    attempt_latencies_ms: Vec::new(),
                    delivered_at: None,
                },
            );
        }
        DeliveryEventKind::AttemptFailed {
            error,
            latency_ms,
            next_attempt_at,
        } => {
            if let Some(delivery) = deliveries.get_mut(&event.delivery_id) {
                delivery.attempts += 1;
                delivery.last_error = Some(error);
                delivery.next_attempt_at = next_attempt_at;
                if let Some(latency) = latency_ms {
                    delivery.attempt_latencies_ms.push(latency);
                }
            }
        }
        DeliveryEventKind::Delivered {
            latency_ms,
            status_code: _,
        } => {
            if let Some(delivery) = deliveries.get_mut(&event.delivery_id) {
                delivery.attempts += 1;
                delivery.status = DeliveryStatus::Delivered;
                delivery.delivered_at = Some(event.timestamp);
                delivery.last_error = None;
                delivery.attempt_latencies_ms.push(latency_ms);
            }
        }
        DeliveryEventKind::Deferred { next_attempt_at } => {
            if let Some(delivery) = deliveries.get_mut(&event.delivery_id) {
                delivery.next_attempt_at = next_attempt_at;
            }
        }
        DeliveryEventKind::DeadLettered { error, latency_ms } => {
            if let Some(delivery) = deliveries.get_mut(&event.delivery_id) {
                delivery.attempts += 1;
                delivery.status = DeliveryStatus::DeadLettered;
                delivery.last_error = Some(error);
                if let Some(latency) = latency_ms {
                    delivery.attempt_latencies_ms.push(latency);
                }
            }
        }
        DeliveryEventKind::Replayed => {
            if let Some(delivery) = deliveries.get_mut(&event.delivery_id) {
                delivery.status = DeliveryStatus::Pending;
                delivery.attempts = 0;
                delivery.next_attempt_at = event.timestamp;
                delivery.last_error = None;
                delivery.attempt_latencies_ms.clear();
            }
        }
    }
}
