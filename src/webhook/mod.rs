//! Durable webhook delivery: a JSONL-backed queue, HMAC payload signing,
//! and a polling dispatcher with per-receiver circuits and a dead-letter
//! queue.

pub mod delivery;
pub mod dispatcher;
pub mod signature;
pub mod store;

pub use delivery::{DeliveryStats, DeliveryStatus, WebhookDelivery};
pub use dispatcher::{DeliverySender, HttpSender, WebhookConfig, WebhookDispatcher};
pub use store::{DeliveryStore, DeliveryStoreError};
