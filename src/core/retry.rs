//! Bounded retry with exponential backoff and jitter.
//!
//! [`RetryExecutor::execute`] wraps any async operation against a named
//! dependency: it gates every attempt on the circuit breaker, reports each
//! outcome back exactly once, and sleeps between retryable failures. Fatal
//! failures propagate immediately and are never retried.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{AttemptError, CallError, DependencyClass, DependencyName, FailureKind};

use super::circuit::CircuitBreaker;

/// Retry tuning for one dependency class.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts including the first (default: 3)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Base delay before the first retry in milliseconds (default: 1000)
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Cap on the computed delay in milliseconds (default: 30000)
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Hard per-attempt timeout in seconds (default: 30)
    #[serde(default = "default_attempt_timeout")]
    pub attempt_timeout_seconds: u64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_base_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30_000
}
fn default_attempt_timeout() -> u64 {
    30
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            attempt_timeout_seconds: default_attempt_timeout(),
        }
    }
}

impl RetryPolicy {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.attempt_timeout_seconds)
    }

    /// Deterministic backoff component for the delay after `attempt`
    /// (1-indexed): `base * 2^(attempt-1)`, capped at `max_delay_ms`.
    pub fn backoff_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1);
        let factor = 2u64.saturating_pow(exponent);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }

    /// Backoff plus random jitter up to the same magnitude. The total is
    /// clamped at `max_delay_ms`, which keeps the delay sequence
    /// non-decreasing across attempts even once the backoff hits the cap.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base = self.backoff_ms(attempt);
        let jitter = if base > 0 {
            rand::thread_rng().gen_range(0..=base)
        } else {
            0
        };
        Duration::from_millis((base + jitter).min(self.max_delay_ms.max(base)))
    }
}

/// Retry policies keyed by dependency class.
///
/// Defaults: generation calls 3 attempts from 1s, publish calls 5 attempts
/// from 2s, webhook deliveries 3 attempts from 2s.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RetryPolicies {
    #[serde(default)]
    pub generation: RetryPolicy,

    #[serde(default = "default_publish_policy")]
    pub publish: RetryPolicy,

    #[serde(default = "default_webhook_policy")]
    pub webhook: RetryPolicy,
}

fn default_publish_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        base_delay_ms: 2000,
        ..RetryPolicy::default()
    }
}

fn default_webhook_policy() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        base_delay_ms: 2000,
        max_delay_ms: 10_000,
        ..RetryPolicy::default()
    }
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self {
            generation: RetryPolicy::default(),
            publish: default_publish_policy(),
            webhook: default_webhook_policy(),
        }
    }
}

impl RetryPolicies {
    pub fn for_class(&self, class: DependencyClass) -> &RetryPolicy {
        match class {
            DependencyClass::Generation => &self.generation,
            DependencyClass::Publish => &self.publish,
            DependencyClass::WebhookDelivery => &self.webhook,
        }
    }
}

/// Executes operations with bounded retry under circuit breaker control.
pub struct RetryExecutor {
    circuits: Arc<CircuitBreaker>,
    policies: RetryPolicies,
}

impl RetryExecutor {
    pub fn new(circuits: Arc<CircuitBreaker>, policies: RetryPolicies) -> Self {
        Self { circuits, policies }
    }

    pub fn policies(&self) -> &RetryPolicies {
        &self.policies
    }

    /// Execute `op` against `dependency` with the policy for `class`.
    ///
    /// The closure receives the 1-indexed attempt number and runs under the
    /// policy's hard per-attempt timeout; exceeding it counts as a
    /// retryable failure. Every attempt outcome is reported to the circuit
    /// breaker exactly once, including attempts abandoned when the caller
    /// drops the returned future.
    pub async fn execute<T, F, Fut>(
        &self,
        dependency: &DependencyName,
        class: DependencyClass,
        op: F,
    ) -> Result<T, CallError>
    where
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<T, AttemptError>>,
    {
        let policy = self.policies.for_class(class);
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            if !self.circuits.allow(dependency) {
                debug!(dependency = %dependency, attempt, "circuit open, call rejected");
                return Err(CallError::CircuitOpen(dependency.clone()));
            }

            // If the caller drops this future mid-attempt, the in-flight
            // call may already have reached the network. The guard records
            // it as a failure unless the attempt runs to completion.
            let guard = AttemptGuard {
                circuits: self.circuits.as_ref(),
                dependency,
                armed: true,
            };

            let outcome = match tokio::time::timeout(policy.attempt_timeout(), op(attempt)).await {
                Ok(Ok(value)) => {
                    guard.disarm();
                    self.circuits.record_success(dependency);
                    return Ok(value);
                }
                Ok(Err(err)) => {
                    guard.disarm();
                    err
                }
                Err(_) => {
                    guard.disarm();
                    AttemptError::timed_out(dependency)
                }
            };

            self.circuits.record_failure(dependency);

            match outcome.kind {
                FailureKind::Fatal => {
                    warn!(
                        dependency = %dependency,
                        attempt,
                        error = %outcome,
                        "fatal failure, not retrying"
                    );
                    return Err(CallError::Fatal {
                        dependency: dependency.clone(),
                        source: outcome,
                    });
                }
                FailureKind::Retryable => {
                    if attempt >= policy.max_attempts {
                        warn!(
                            dependency = %dependency,
                            attempts = attempt,
                            error = %outcome,
                            "retries exhausted"
                        );
                        return Err(CallError::Exhausted {
                            dependency: dependency.clone(),
                            attempts: attempt,
                            last: outcome,
                        });
                    }

                    let delay = policy.delay_for_attempt(attempt);
                    debug!(
                        dependency = %dependency,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %outcome,
                        "retryable failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Records a dropped in-flight attempt as a circuit failure.
struct AttemptGuard<'a> {
    circuits: &'a CircuitBreaker,
    dependency: &'a DependencyName,
    armed: bool,
}

impl AttemptGuard<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.circuits.record_failure(self.dependency);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::core::circuit::CircuitConfig;

    fn executor() -> RetryExecutor {
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 100,
            recovery_timeout_seconds: 30,
        }));
        RetryExecutor::new(circuits, RetryPolicies::default())
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            attempt_timeout_seconds: 30,
        };

        assert_eq!(policy.backoff_ms(1), 1000);
        assert_eq!(policy.backoff_ms(2), 2000);
        assert_eq!(policy.backoff_ms(3), 4000);
        assert_eq!(policy.backoff_ms(4), 5000); // capped
    }

    #[test]
    fn test_jitter_stays_within_one_backoff() {
        let policy = RetryPolicy::default();

        for _ in 0..50 {
            let delay = policy.delay_for_attempt(2);
            let base = policy.backoff_ms(2);
            assert!(delay.as_millis() as u64 >= base);
            assert!(delay.as_millis() as u64 <= base * 2);
        }
    }

    #[test]
    fn test_delay_clamped_once_backoff_hits_cap() {
        let policy = RetryPolicy {
            max_attempts: 6,
            base_delay_ms: 1000,
            max_delay_ms: 5000,
            attempt_timeout_seconds: 30,
        };

        for _ in 0..50 {
            assert_eq!(policy.delay_for_attempt(4), Duration::from_millis(5000));
            assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(5000));
        }
    }

    #[test]
    fn test_delays_never_decrease_across_attempts() {
        let policy = RetryPolicy {
            max_attempts: 8,
            base_delay_ms: 500,
            max_delay_ms: 4000,
            attempt_timeout_seconds: 30,
        };

        for _ in 0..50 {
            let mut previous = Duration::ZERO;
            for attempt in 1..8 {
                let delay = policy.delay_for_attempt(attempt);
                assert!(
                    delay >= previous,
                    "delay shrank between attempts: {:?} after {:?}",
                    delay,
                    previous
                );
                previous = delay;
            }
        }
    }

    #[tokio::test]
    async fn test_cancelled_attempt_counts_as_circuit_failure() {
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 100,
            recovery_timeout_seconds: 30,
        }));
        let exec = Arc::new(RetryExecutor::new(circuits.clone(), RetryPolicies::default()));
        let dep = DependencyName::from("openai");
        let started = Arc::new(tokio::sync::Notify::new());

        let handle = tokio::spawn({
            let exec = exec.clone();
            let dep = dep.clone();
            let started = started.clone();
            async move {
                let _: Result<u32, _> = exec
                    .execute(&dep, DependencyClass::Generation, |_| {
                        let started = started.clone();
                        async move {
                            started.notify_one();
                            std::future::pending::<Result<u32, AttemptError>>().await
                        }
                    })
                    .await;
            }
        });

        started.notified().await;
        handle.abort();
        let _ = handle.await;

        assert_eq!(circuits.snapshot(&dep).consecutive_failures, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_first_attempt() {
        let exec = executor();
        let dep = DependencyName::from("openai");
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = exec
            .execute(&dep, DependencyClass::Generation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(42) }
            })
            .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_failure_never_retried() {
        let exec = executor();
        let dep = DependencyName::from("openai");
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = exec
            .execute(&dep, DependencyClass::Generation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::from_status(400, "bad request")) }
            })
            .await;

        assert!(matches!(result, Err(CallError::Fatal { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retryable_exhausts_attempt_budget() {
        let exec = executor();
        let dep = DependencyName::from("openai");
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = exec
            .execute(&dep, DependencyClass::Generation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::from_status(503, "unavailable")) }
            })
            .await;

        match result {
            Err(CallError::Exhausted { attempts, last, .. }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last.status, Some(503));
            }
            other => panic!("expected Exhausted, got {:?}", other.map(|_| ())),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let exec = executor();
        let dep = DependencyName::from("meta");
        let calls = AtomicU32::new(0);

        let result: Result<&str, _> = exec
            .execute(&dep, DependencyClass::Publish, |attempt| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 3 {
                        Err(AttemptError::from_status(500, "flaky"))
                    } else {
                        Ok("published")
                    }
                }
            })
            .await;

        assert_eq!(result.unwrap(), "published");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_circuit_short_circuits_retries() {
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig {
            failure_threshold: 2,
            recovery_timeout_seconds: 300,
        }));
        let exec = RetryExecutor::new(circuits.clone(), RetryPolicies::default());
        let dep = DependencyName::from("meta");
        let calls = AtomicU32::new(0);

        // The circuit opens after the second failure; the third attempt is
        // rejected before touching the dependency.
        let result: Result<u32, _> = exec
            .execute(&dep, DependencyClass::Generation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(AttemptError::from_status(500, "down")) }
            })
            .await;

        assert!(matches!(result, Err(CallError::CircuitOpen(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_retryable() {
        let exec = executor();
        let dep = DependencyName::from("slow");
        let calls = AtomicU32::new(0);

        let result: Result<u32, _> = exec
            .execute(&dep, DependencyClass::Generation, |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async {
                    tokio::time::sleep(Duration::from_secs(3600)).await;
                    Ok(1)
                }
            })
            .await;

        assert!(matches!(result, Err(CallError::Exhausted { .. })));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
