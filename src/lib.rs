//! palisade - Resilient external-call orchestration
//!
//! A protection layer between a service and the flaky, metered,
//! rate-limited external dependencies it calls: AI generation backends,
//! social platform publishers, and customer webhook receivers.
//!
//! # Architecture
//!
//! Every outbound call passes through a composed pipeline:
//! - Response cache: identical requests within the TTL never leave the
//!   process
//! - Usage ledger: per-identity request, token and cost limits, enforced
//!   before the dependency is invoked and journaled durably
//! - Circuit breaker: per-dependency fail-fast once a dependency starts
//!   failing consistently
//! - Retry executor: bounded retries with exponential backoff and jitter
//!   for transient failures
//!
//! Webhook deliveries get the same treatment asynchronously: a durable
//! JSONL queue, HMAC-signed payloads, per-receiver circuits and a
//! dead-letter queue with operator-driven replay.
//!
//! # Modules
//!
//! - `core`: Orchestration logic (circuit, retry, cache, ledger)
//! - `domain`: Data structures (DependencyName, AttemptError, CostSample)
//! - `webhook`: Durable webhook delivery
//! - `health`: Aggregated dependency health
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Aggregated dependency health
//! palisade health
//!
//! # Usage against limits for an API key
//! palisade usage key-123 --period day
//!
//! # Run the webhook dispatch worker
//! palisade dispatch
//!
//! # Replay a dead-lettered delivery
//! palisade deadletters replay <delivery-id>
//! ```

pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod health;
pub mod webhook;

// Re-export main types at crate root for convenience
pub use crate::core::{
    CacheStats, CallOutcome, CallSpec, CircuitBreaker, CircuitState, Orchestrator, ResponseCache,
    RetryExecutor, UsageLedger,
};
pub use domain::{AttemptError, CallError, CostSample, DependencyClass, DependencyName};
pub use health::{HealthAggregator, HealthReport, HealthStatus};
pub use webhook::{DeliveryStore, WebhookDispatcher};
