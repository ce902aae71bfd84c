//! Composed call path for external dependencies.
//!
//! A caller asks for "dependency call C for cache key K under identity I":
//! the cache is consulted first; on a miss the ledger reserves the
//! estimated cost; the retry executor then runs the call under circuit
//! breaker control; a success corrects the ledger, lands in the cache, and
//! is returned. Cache hits are free: they never consume quota because the
//! paid dependency is never invoked.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, instrument, warn};

use crate::domain::{AttemptError, CallError, CostSample, DependencyClass, DependencyName};

use super::cache::{Fingerprint, ResponseCache};
use super::circuit::CircuitBreaker;
use super::ledger::{LedgerError, UsageLedger};
use super::retry::RetryExecutor;

/// What a dependency call returned: the typed value plus the usage the
/// caller observed (token counts from the provider response). `None` means
/// the reservation's estimate stands.
pub struct DependencyResponse<T> {
    pub value: T,
    pub usage: Option<CostSample>,
}

impl<T> DependencyResponse<T> {
    /// A response with no usage report; the ledger keeps the estimate.
    pub fn new(value: T) -> Self {
        Self { value, usage: None }
    }

    pub fn with_usage(value: T, usage: CostSample) -> Self {
        Self {
            value,
            usage: Some(usage),
        }
    }
}

/// Parameters of one composed call.
#[derive(Debug, Clone)]
pub struct CallSpec {
    pub dependency: DependencyName,
    pub class: DependencyClass,
    pub identity: String,

    /// Cache key; `None` for non-idempotent operations that must never be
    /// served from cache.
    pub fingerprint: Option<Fingerprint>,

    /// Reserved against the identity's quota before the call.
    pub estimate: CostSample,

    /// TTL for caching a successful result; used when `fingerprint` is set.
    pub cache_ttl: Option<Duration>,
}

/// Result of a composed call.
#[derive(Debug, Clone)]
pub struct CallOutcome<T> {
    pub value: T,
    pub from_cache: bool,
}

/// Front door of the orchestration layer. Shared handles, cheap to clone.
#[derive(Clone)]
pub struct Orchestrator {
    circuits: Arc<CircuitBreaker>,
    cache: Arc<ResponseCache>,
    ledger: Arc<UsageLedger>,
    retry: Arc<RetryExecutor>,
}

impl Orchestrator {
    pub fn new(
        circuits: Arc<CircuitBreaker>,
        cache: Arc<ResponseCache>,
        ledger: Arc<UsageLedger>,
        retry: Arc<RetryExecutor>,
    ) -> Self {
        Self {
            circuits,
            cache,
            ledger,
            retry,
        }
    }

    pub fn circuits(&self) -> &Arc<CircuitBreaker> {
        &self.circuits
    }

    pub fn cache(&self) -> &Arc<ResponseCache> {
        &self.cache
    }

    pub fn ledger(&self) -> &Arc<UsageLedger> {
        &self.ledger
    }

    /// Perform a dependency call with caching, quota, circuit breaking and
    /// bounded retry.
    ///
    /// The operation closure receives the 1-indexed attempt number. On any
    /// terminal failure after the reservation, the ledger is corrected to
    /// zero actual cost; the request count stands.
    #[instrument(skip(self, spec, op), fields(dependency = %spec.dependency, identity = %spec.identity))]
    pub async fn call<T, F, Fut>(&self, spec: &CallSpec, op: F) -> Result<CallOutcome<T>, CallError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn(u32) -> Fut,
        Fut: Future<Output = Result<DependencyResponse<T>, AttemptError>>,
    {
        if let Some(fingerprint) = &spec.fingerprint {
            if let Some(cached) = self.cache.get(fingerprint) {
                match serde_json::from_value(cached) {
                    Ok(value) => {
                        debug!("served from cache");
                        return Ok(CallOutcome {
                            value,
                            from_cache: true,
                        });
                    }
                    Err(err) => {
                        // A stale entry whose shape no longer matches the
                        // caller's type; drop it and fall through to the
                        // real call.
                        warn!(error = %err, "cached value failed to deserialize, invalidating");
                        self.cache.invalidate(fingerprint);
                    }
                }
            }
        }

        let reservation = self
            .ledger
            .check_and_reserve(&spec.identity, spec.estimate)
            .await
            .map_err(map_ledger_error)?;

        let result = self
            .retry
            .execute(&spec.dependency, spec.class, |attempt| op(attempt))
            .await;

        match result {
            Ok(response) => {
                let actual = response.usage.unwrap_or(spec.estimate);
                self.ledger
                    .commit(&reservation, actual)
                    .await
                    .map_err(map_ledger_error)?;

                if let Some(fingerprint) = &spec.fingerprint {
                    let ttl = spec.cache_ttl.unwrap_or(Duration::from_secs(3600));
                    match serde_json::to_value(&response.value) {
                        Ok(value) => self.cache.put(fingerprint.clone(), value, ttl),
                        Err(err) => {
                            warn!(error = %err, "result not serializable, skipping cache")
                        }
                    }
                }

                Ok(CallOutcome {
                    value: response.value,
                    from_cache: false,
                })
            }
            Err(err) => {
                // The paid call did not complete; refund the reserved units
                // and cost. The journal keeps the correction either way.
                if let Err(commit_err) = self.ledger.commit(&reservation, CostSample::zero()).await
                {
                    warn!(error = %commit_err, "failed to correct reservation after call failure");
                }
                Err(err)
            }
        }
    }
}

fn map_ledger_error(err: LedgerError) -> CallError {
    match err {
        LedgerError::LimitExceeded { identity, exceeded } => {
            CallError::LimitExceeded { identity, exceeded }
        }
        other => CallError::Storage(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use serde_json::json;
    use tempfile::TempDir;

    use crate::core::circuit::CircuitConfig;
    use crate::core::ledger::{LimitSettings, Period, PeriodLimits};
    use crate::core::retry::RetryPolicies;

    async fn orchestrator(temp: &TempDir, limits: LimitSettings) -> Orchestrator {
        let circuits = Arc::new(CircuitBreaker::new(CircuitConfig::default()));
        let cache = Arc::new(ResponseCache::new());
        let ledger = Arc::new(
            UsageLedger::open(temp.path().join("usage.jsonl"), limits)
                .await
                .unwrap(),
        );
        let retry = Arc::new(RetryExecutor::new(circuits.clone(), RetryPolicies::default()));
        Orchestrator::new(circuits, cache, ledger, retry)
    }

    fn generation_spec(fingerprint: Option<Fingerprint>) -> CallSpec {
        CallSpec {
            dependency: DependencyName::from("openai"),
            class: DependencyClass::Generation,
            identity: "key-1".to_string(),
            fingerprint,
            estimate: CostSample::new(100, 0.01),
            cache_ttl: Some(Duration::from_secs(3600)),
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit_invokes_dependency_once() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, LimitSettings::default()).await;
        let fp = Fingerprint::compute("generate", &json!({"topic": "launch"})).unwrap();
        let spec = generation_spec(Some(fp));
        let calls = AtomicU32::new(0);

        let op = |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(DependencyResponse::new("post body".to_string())) }
        };

        let first = orch.call(&spec, op).await.unwrap();
        assert!(!first.from_cache);

        let second = orch.call(&spec, op).await.unwrap();
        assert!(second.from_cache);
        assert_eq!(second.value, "post body");

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cache_hit_consumes_no_quota() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, LimitSettings::default()).await;
        let fp = Fingerprint::compute("generate", &json!({"topic": "launch"})).unwrap();
        let spec = generation_spec(Some(fp));

        let op = |_| async { Ok(DependencyResponse::new(1u32)) };
        orch.call(&spec, op).await.unwrap();
        orch.call(&spec, op).await.unwrap();
        orch.call(&spec, op).await.unwrap();

        let summary = orch.ledger().report("key-1", Period::Day).await;
        assert_eq!(summary.requests, 1, "only the miss consumed quota");
    }

    #[tokio::test]
    async fn test_limit_exceeded_never_invokes_dependency() {
        let temp = TempDir::new().unwrap();
        let limits = LimitSettings {
            daily: PeriodLimits {
                requests: 10,
                units: 1_000_000,
                cost_usd: 1000.0,
            },
            ..LimitSettings::default()
        };
        let orch = orchestrator(&temp, limits).await;
        let calls = AtomicU32::new(0);

        let op = |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(DependencyResponse::new(0u32)) }
        };

        for _ in 0..10 {
            let spec = generation_spec(None);
            orch.call(&spec, op).await.unwrap();
        }

        let spec = generation_spec(None);
        let err = orch.call(&spec, op).await.unwrap_err();
        assert!(matches!(err, CallError::LimitExceeded { .. }));
        assert_eq!(
            calls.load(Ordering::SeqCst),
            10,
            "11th call never reached the dependency"
        );
    }

    #[tokio::test]
    async fn test_reported_usage_corrects_ledger() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, LimitSettings::default()).await;
        let spec = generation_spec(None);

        orch.call(&spec, |_| async {
            Ok(DependencyResponse::with_usage(
                "ok".to_string(),
                CostSample::new(250, 0.025),
            ))
        })
        .await
        .unwrap();

        let summary = orch.ledger().report("key-1", Period::Day).await;
        assert_eq!(summary.units, 250);
        assert!((summary.cost_usd - 0.025).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failed_call_refunds_cost_but_counts_request() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, LimitSettings::default()).await;
        let spec = generation_spec(None);

        let result: Result<CallOutcome<u32>, _> = orch
            .call(&spec, |_| async {
                Err(AttemptError::from_status(400, "bad prompt"))
            })
            .await;
        assert!(matches!(result, Err(CallError::Fatal { .. })));

        let summary = orch.ledger().report("key-1", Period::Day).await;
        assert_eq!(summary.requests, 1);
        assert_eq!(summary.units, 0);
        assert!(summary.cost_usd.abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_failure_is_not_cached() {
        let temp = TempDir::new().unwrap();
        let orch = orchestrator(&temp, LimitSettings::default()).await;
        let fp = Fingerprint::compute("generate", &json!({"topic": "x"})).unwrap();
        let spec = generation_spec(Some(fp.clone()));

        let result: Result<CallOutcome<u32>, _> = orch
            .call(&spec, |_| async {
                Err(AttemptError::from_status(422, "validation"))
            })
            .await;
        assert!(result.is_err());
        assert_eq!(orch.cache().get(&fp), None);
    }
}
