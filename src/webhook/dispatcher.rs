//! Webhook delivery worker.
//!
//! Pulls due deliveries from the store, signs and posts them, and records
//! every outcome back to the log. Each receiver host gets its own circuit
//! so one dead receiver cannot stall the rest of the queue.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::core::circuit::CircuitBreaker;
use crate::domain::{AttemptError, DependencyName, FailureKind};

use super::delivery::WebhookDelivery;
use super::signature::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use super::store::{DeliveryStore, DeliveryStoreError};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_poll_interval_seconds")]
    pub poll_interval_seconds: u64,
    #[serde(default)]
    pub secret: Option<String>,
}

fn default_max_attempts() -> u32 {
    5
}

fn default_base_delay_ms() -> u64 {
    5_000
}

fn default_max_delay_ms() -> u64 {
    120_000
}

fn default_poll_interval_seconds() -> u64 {
    30
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            poll_interval_seconds: default_poll_interval_seconds(),
            secret: None,
        }
    }
}

impl WebhookConfig {
    /// Exponential backoff for the next attempt after `attempts` failures.
    pub fn backoff_ms(&self, attempts: u32) -> u64 {
        let exp = attempts.saturating_sub(1).min(16);
        self.base_delay_ms
            .saturating_mul(1u64 << exp)
            .min(self.max_delay_ms)
    }
}

/// Signed envelope posted to the receiver.
#[derive(Debug, Serialize)]
struct WebhookEnvelope<'a> {
    delivery_id: uuid::Uuid,
    event_type: &'a str,
    data: &'a serde_json::Value,
    timestamp: chrono::DateTime<chrono::Utc>,
}

/// Transport seam for posting a webhook body.
#[async_trait]
pub trait DeliverySender: Send + Sync {
    async fn post(
        &self,
        target: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<u16, AttemptError>;
}

/// Production sender backed by reqwest.
pub struct HttpSender {
    client: reqwest::Client,
}

impl HttpSender {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl DeliverySender for HttpSender {
    async fn post(
        &self,
        target: &str,
        body: &[u8],
        headers: &HashMap<String, String>,
    ) -> Result<u16, AttemptError> {
        let mut request = self
            .client
            .post(target)
            .header("Content-Type", "application/json")
            .body(body.to_vec());
        for (name, value) in headers {
            request = request.header(name, value);
        }
        let response = request
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;
        Ok(response.status().as_u16())
    }
}

pub struct WebhookDispatcher {
    store: Arc<DeliveryStore>,
    sender: Arc<dyn DeliverySender>,
    circuits: Arc<CircuitBreaker>,
    config: WebhookConfig,
}

impl WebhookDispatcher {
    pub fn new(
        store: Arc<DeliveryStore>,
        sender: Arc<dyn DeliverySender>,
        circuits: Arc<CircuitBreaker>,
        config: WebhookConfig,
    ) -> Self {
        Self {
            store,
            sender,
            circuits,
            config,
        }
    }

    /// Process everything currently due, one delivery at a time.
    #[instrument(skip(self))]
    pub async fn tick(&self) -> Result<usize, DeliveryStoreError> {
        let due = self.store.due(Utc::now()).await?;
        let count = due.len();
        for delivery in due {
            self.attempt(delivery).await?;
        }
        Ok(count)
    }

    /// Run forever, polling the store at the configured interval.
    pub async fn run(&self) -> Result<(), DeliveryStoreError> {
        let interval = Duration::from_secs(self.config.poll_interval_seconds);
        loop {
            let processed = self.tick().await?;
            if processed > 0 {
                info!(processed, "webhook dispatch pass complete");
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn attempt(&self, delivery: WebhookDelivery) -> Result<(), DeliveryStoreError> {
        let circuit_key = circuit_key(&delivery.target);

        // A blocked circuit defers the delivery without spending an attempt.
        if !self.circuits.allow(&circuit_key) {
            let next = Utc::now() + chrono::Duration::milliseconds(self.config.base_delay_ms as i64);
            warn!(
                delivery_id = %delivery.id,
                target = %delivery.target,
                "receiver circuit open, deferring delivery"
            );
            return self.store.record_deferred(delivery.id, next).await;
        }

        let envelope = WebhookEnvelope {
            delivery_id: delivery.id,
            event_type: &delivery.event_type,
            data: &delivery.payload,
            timestamp: Utc::now(),
        };
        let body = serde_json::to_vec(&envelope)?;

        let mut headers = HashMap::new();
        headers.insert(
            TIMESTAMP_HEADER.to_string(),
            envelope.timestamp.timestamp().to_string(),
        );
        if let Some(secret) = &self.config.secret {
            headers.insert(SIGNATURE_HEADER.to_string(), signature::sign(&body, secret));
        }

        let started = Instant::now();
        let result = self.sender.post(&delivery.target, &body, &headers).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(status) if (200..300).contains(&status) => {
                self.circuits.record_success(&circuit_key);
                info!(
                    delivery_id = %delivery.id,
                    status,
                    latency_ms,
                    "webhook delivered"
                );
                self.store
                    .record_delivered(delivery.id, status, latency_ms)
                    .await
            }
            Ok(status) => {
                let error =
                    AttemptError::from_status(status, format!("receiver returned {}", status));
                self.handle_failure(&delivery, &circuit_key, error, Some(latency_ms))
                    .await
            }
            Err(error) => {
                self.handle_failure(&delivery, &circuit_key, error, Some(latency_ms))
                    .await
            }
        }
    }

    async fn handle_failure(
        &self,
        delivery: &WebhookDelivery,
        circuit_key: &DependencyName,
        error: AttemptError,
        latency_ms: Option<u64>,
    ) -> Result<(), DeliveryStoreError> {
        self.circuits.record_failure(circuit_key);

        let attempts_after = delivery.attempts + 1;
        let exhausted = attempts_after >= self.config.max_attempts;

        if error.kind == FailureKind::Fatal || exhausted {
            warn!(
                delivery_id = %delivery.id,
                attempts = attempts_after,
                error = %error.message,
                "webhook dead-lettered"
            );
            self.store
                .record_dead_lettered(delivery.id, &error.message, latency_ms)
                .await
        } else {
            let backoff = self.config.backoff_ms(attempts_after);
            let next = Utc::now() + chrono::Duration::milliseconds(backoff as i64);
            warn!(
                delivery_id = %delivery.id,
                attempts = attempts_after,
                backoff_ms = backoff,
                error = %error.message,
                "webhook attempt failed, will retry"
            );
            self.store
                .record_failure(delivery.id, &error.message, latency_ms, next)
                .await
        }
    }
}

/// One circuit per receiver host, not per full URL, so all hooks pointed
/// at the same dead receiver back off together.
fn circuit_key(target: &str) -> DependencyName {
    match reqwest::Url::parse(target) {
        Ok(url) => match url.host_str() {
            Some(host) => DependencyName::from(format!("webhook:{}", host)),
            None => DependencyName::from(format!("webhook:{}", target)),
        },
        Err(_) => DependencyName::from(format!("webhook:{}", target)),
    }
}
