//! Delivery records and the append-only events they are derived from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of an outbound delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    /// Waiting for its next attempt.
    Pending,

    /// Accepted by the receiver; terminal.
    Delivered,

    /// Attempt budget exhausted; retained for inspection and replay.
    DeadLettered,
}

/// Current state of one delivery, derived by replaying its events.
///
/// Exclusively owned by the dispatcher from enqueue until a terminal
/// status; attempts for one delivery are strictly sequential.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookDelivery {
    pub id: Uuid,
    pub target: String,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub status: DeliveryStatus,

    /// HTTP attempts made so far (failed and successful).
    pub attempts: u32,

    /// Earliest time the next attempt may run.
    pub next_attempt_at: DateTime<Utc>,

    pub last_error: Option<String>,

    /// Per-attempt latency samples, in order.
    pub attempt_latencies_ms: Vec<u64>,

    pub delivered_at: Option<DateTime<Utc>>,
}

impl WebhookDelivery {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            DeliveryStatus::Delivered | DeliveryStatus::DeadLettered
        )
    }

    /// Ready for an attempt at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == DeliveryStatus::Pending && self.next_attempt_at <= now
    }
}

/// One line in the delivery log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub timestamp: DateTime<Utc>,
    pub delivery_id: Uuid,

    #[serde(flatten)]
    pub kind: DeliveryEventKind,
}

/// What happened to a delivery. The log is append-only; state is rebuilt
/// by applying events in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliveryEventKind {
    Enqueued {
        target: String,
        event_type: String,
        payload: serde_json::Value,
    },

    AttemptFailed {
        error: String,
        latency_ms: Option<u64>,
        next_attempt_at: DateTime<Utc>,
    },

    Delivered {
        status_code: u16,
        latency_ms: u64,
    },

    /// Pushed back without an attempt; the receiver's circuit was open.
    Deferred {
        next_attempt_at: DateTime<Utc>,
    },

    /// The attempt that exhausted the budget, folded into the terminal
    /// transition.
    DeadLettered {
        error: String,
        latency_ms: Option<u64>,
    },

    /// Operator-triggered re-enqueue of a dead-letter with a fresh attempt
    /// budget.
    Replayed,
}

/// Queue-level counts for monitoring.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct DeliveryStats {
    pub pending: usize,
    pub delivered: usize,
    pub dead_lettered: usize,
}

impl DeliveryStats {
    pub fn total(&self) -> usize {
        self.pending + self.delivered + self.dead_lettered
    }
}
