//! Orchestration logic: circuit breaking, retry, caching, usage accounting,
//! and the composed call path that ties them together.

pub mod cache;
pub mod circuit;
pub mod ledger;
pub mod orchestrator;
pub mod retry;

pub use cache::{CacheStats, CacheTtls, Fingerprint, ResponseCache};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitSnapshot, CircuitState};
pub use ledger::{
    LedgerError, LimitSettings, Period, PeriodLimits, Reservation, UsageLedger, UsageSummary,
};
pub use orchestrator::{CallOutcome, CallSpec, DependencyResponse, Orchestrator};
pub use retry::{RetryExecutor, RetryPolicies, RetryPolicy};
