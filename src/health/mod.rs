//! Aggregated dependency health.
//!
//! Each dependency is probed on demand; the composed report folds probe
//! results together with circuit state and is cached briefly so monitors
//! polling the report do not hammer the dependencies themselves.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{info, instrument, warn};

use crate::core::circuit::{CircuitBreaker, CircuitState};
use crate::domain::{AttemptError, DependencyName};

/// Health of a single dependency or of the service as a whole.
///
/// Ordering is by severity, so the overall status of a report is the
/// maximum across its dependencies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Up,
    Degraded,
    Down,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Up => "up",
            Self::Degraded => "degraded",
            Self::Down => "down",
        };
        f.write_str(s)
    }
}

/// Probe result for one dependency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub circuit_state: CircuitState,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

/// The composed report returned to callers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthReport {
    pub overall: HealthStatus,
    pub checked_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub dependencies: BTreeMap<String, HealthSnapshot>,
}

/// Probe seam. Production probes issue an HTTP GET against the
/// dependency's health endpoint; tests substitute scripted probes.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    fn dependency(&self) -> DependencyName;

    async fn probe(&self) -> Result<(), AttemptError>;
}

/// HTTP GET probe, healthy on any 2xx.
pub struct HttpProbe {
    dependency: DependencyName,
    url: String,
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(
        dependency: DependencyName,
        url: String,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            dependency,
            url,
            client,
        })
    }
}

#[async_trait]
impl HealthProbe for HttpProbe {
    fn dependency(&self) -> DependencyName {
        self.dependency.clone()
    }

    async fn probe(&self) -> Result<(), AttemptError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| AttemptError::from_reqwest(&e))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(AttemptError::from_status(
                status.as_u16(),
                format!("health endpoint returned {}", status),
            ))
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_interval_seconds")]
    pub interval_seconds: u64,
    #[serde(default = "default_probe_timeout_seconds")]
    pub probe_timeout_seconds: u64,
    #[serde(default = "default_report_ttl_seconds")]
    pub report_ttl_seconds: u64,
}

fn default_interval_seconds() -> u64 {
    300
}

fn default_probe_timeout_seconds() -> u64 {
    5
}

fn default_report_ttl_seconds() -> u64 {
    30
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_seconds: default_interval_seconds(),
            probe_timeout_seconds: default_probe_timeout_seconds(),
            report_ttl_seconds: default_report_ttl_seconds(),
        }
    }
}

pub struct HealthAggregator {
    probes: Vec<Arc<dyn HealthProbe>>,
    circuits: Arc<CircuitBreaker>,
    config: HealthConfig,
    latest: RwLock<Option<(Instant, HealthReport)>>,
}

impl HealthAggregator {
    pub fn new(
        probes: Vec<Arc<dyn HealthProbe>>,
        circuits: Arc<CircuitBreaker>,
        config: HealthConfig,
    ) -> Self {
        Self {
            probes,
            circuits,
            config,
            latest: RwLock::new(None),
        }
    }

    /// Current report, served from cache while fresh.
    pub async fn check(&self) -> HealthReport {
        let ttl = Duration::from_secs(self.config.report_ttl_seconds);
        {
            let cached = self.latest.read().await;
            if let Some((at, report)) = cached.as_ref() {
                if at.elapsed() < ttl {
                    return report.clone();
                }
            }
        }

        let report = self.collect().await;
        let mut cached = self.latest.write().await;
        *cached = Some((Instant::now(), report.clone()));
        report
    }

    /// Most recent report, if any check has run.
    pub async fn latest(&self) -> Option<HealthReport> {
        self.latest.read().await.as_ref().map(|(_, r)| r.clone())
    }

    #[instrument(skip(self))]
    async fn collect(&self) -> HealthReport {
        let started = Instant::now();
        let probe_timeout = Duration::from_secs(self.config.probe_timeout_seconds);
        let mut dependencies = BTreeMap::new();

        for probe in &self.probes {
            let dependency = probe.dependency();
            let snapshot = self.probe_one(probe.as_ref(), &dependency, probe_timeout).await;
            if snapshot.status != HealthStatus::Up {
                warn!(
                    dependency = %dependency,
                    status = %snapshot.status,
                    error = snapshot.error.as_deref().unwrap_or(""),
                    "dependency unhealthy"
                );
            }
            dependencies.insert(dependency.to_string(), snapshot);
        }

        let overall = dependencies
            .values()
            .map(|s| s.status)
            .max()
            .unwrap_or(HealthStatus::Up);

        HealthReport {
            overall,
            checked_at: Utc::now(),
            duration_ms: started.elapsed().as_millis() as u64,
            dependencies,
        }
    }

    async fn probe_one(
        &self,
        probe: &dyn HealthProbe,
        dependency: &DependencyName,
        timeout: Duration,
    ) -> HealthSnapshot {
        let circuit = self.circuits.snapshot(dependency);

        // An open circuit already means the dependency is failing; skip
        // the probe rather than add load to a struggling service.
        if circuit.state == CircuitState::Open {
            return HealthSnapshot {
                status: HealthStatus::Down,
                circuit_state: circuit.state,
                latency_ms: None,
                error: Some("circuit open".to_string()),
            };
        }

        let started = Instant::now();
        let result = tokio::time::timeout(timeout, probe.probe()).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        match result {
            Ok(Ok(())) => {
                // Probe passed but the circuit remembers recent trouble.
                let status = if circuit.state == CircuitState::HalfOpen
                    || circuit.consecutive_failures > 0
                {
                    HealthStatus::Degraded
                } else {
                    HealthStatus::Up
                };
                HealthSnapshot {
                    status,
                    circuit_state: circuit.state,
                    latency_ms: Some(latency_ms),
                    error: None,
                }
            }
            Ok(Err(err)) => HealthSnapshot {
                status: HealthStatus::Down,
                circuit_state: circuit.state,
                latency_ms: Some(latency_ms),
                error: Some(err.message),
            },
            Err(_) => HealthSnapshot {
                status: HealthStatus::Down,
                circuit_state: circuit.state,
                latency_ms: Some(latency_ms),
                error: Some("health probe timed out".to_string()),
            },
        }
    }

    /// Background loop refreshing the report at the configured interval.
    pub async fn run(&self) {
        let interval = Duration::from_secs(self.config.interval_seconds);
        loop {
            let report = self.collect().await;
            info!(overall = %report.overall, "health check complete");
            {
                let mut cached = self.latest.write().await;
                *cached = Some((Instant::now(), report));
            }
            tokio::time::sleep(interval).await;
        }
    }
}
