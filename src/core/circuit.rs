//! Per-dependency circuit breaker.
//!
//! Each dependency gets its own three-state machine:
//! - `Closed`: calls pass through, consecutive failures are counted
//! - `Open`: calls fail fast until the recovery timeout elapses
//! - `HalfOpen`: exactly one trial call probes the dependency
//!
//! State transitions:
//! ```text
//! Closed → Open: consecutive failures reach the threshold
//! Open → HalfOpen: first allow() after the recovery timeout
//! HalfOpen → Closed: trial succeeds (counter reset)
//! HalfOpen → Open: trial fails (timer restarts)
//! ```
//!
//! While the trial is in flight, every other caller sees the circuit as
//! open. Circuits are created lazily on first reference and never removed.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::domain::DependencyName;

/// Circuit breaker tuning, shared by all dependencies.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that open the circuit (default: 5)
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// Seconds the circuit stays open before granting a trial (default: 30)
    #[serde(default = "default_recovery_timeout")]
    pub recovery_timeout_seconds: u64,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_recovery_timeout() -> u64 {
    30
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            recovery_timeout_seconds: default_recovery_timeout(),
        }
    }
}

impl CircuitConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_secs(self.recovery_timeout_seconds)
    }
}

/// Observable circuit state, exposed through snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Read-only view of one dependency's circuit, taken under its lock.
#[derive(Debug, Clone)]
pub struct CircuitSnapshot {
    pub dependency: DependencyName,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub last_transition: DateTime<Utc>,
}

/// Internal state machine for a single dependency.
struct Circuit {
    state: State,
    last_transition: DateTime<Utc>,
}

enum State {
    Closed { failures: u32 },
    Open { since: Instant },
    HalfOpen,
}

impl Circuit {
    fn new() -> Self {
        Self {
            state: State::Closed { failures: 0 },
            last_transition: Utc::now(),
        }
    }

    fn allow_at(&mut self, now: Instant, config: &CircuitConfig, name: &DependencyName) -> bool {
        match self.state {
            State::Closed { .. } => true,
            State::Open { since } => {
                if now.duration_since(since) >= config.recovery_timeout() {
                    // Recovery timeout elapsed; this caller takes the single
                    // half-open trial slot.
                    self.transition(State::HalfOpen);
                    info!(dependency = %name, "circuit half-open, granting trial call");
                    true
                } else {
                    false
                }
            }
            // Trial already in flight; everyone else is rejected.
            State::HalfOpen => false,
        }
    }

    fn record_success(&mut self, name: &DependencyName) {
        match self.state {
            State::Closed { failures: 0 } => {}
            _ => {
                self.transition(State::Closed { failures: 0 });
                info!(dependency = %name, "circuit closed");
            }
        }
    }

    fn record_failure_at(&mut self, now: Instant, config: &CircuitConfig, name: &DependencyName) {
        match self.state {
            State::Closed { failures } => {
                let failures = failures + 1;
                if failures >= config.failure_threshold {
                    self.transition(State::Open { since: now });
                    warn!(
                        dependency = %name,
                        failures,
                        "circuit opened, failing fast"
                    );
                } else {
                    self.state = State::Closed { failures };
                    debug!(dependency = %name, failures, "failure recorded");
                }
            }
            State::HalfOpen => {
                self.transition(State::Open { since: now });
                warn!(dependency = %name, "trial call failed, circuit re-opened");
            }
            // A straggler from before the circuit opened; the timer is not
            // restarted so recovery is not pushed out indefinitely.
            State::Open { .. } => {}
        }
    }

    fn transition(&mut self, state: State) {
        self.state = state;
        self.last_transition = Utc::now();
    }

    fn snapshot(&self, dependency: &DependencyName) -> CircuitSnapshot {
        let (state, consecutive_failures) = match self.state {
            State::Closed { failures } => (CircuitState::Closed, failures),
            State::Open { .. } => (CircuitState::Open, 0),
            State::HalfOpen => (CircuitState::HalfOpen, 0),
        };

        CircuitSnapshot {
            dependency: dependency.clone(),
            state,
            consecutive_failures,
            last_transition: self.last_transition,
        }
    }
}

/// Registry of per-dependency circuits.
///
/// The registry lock is held only for map lookup/insert; all state machine
/// work happens under the individual circuit's lock, so unrelated
/// dependencies never serialize each other.
pub struct CircuitBreaker {
    config: CircuitConfig,
    circuits: Mutex<HashMap<DependencyName, Arc<Mutex<Circuit>>>>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitConfig) -> Self {
        Self {
            config,
            circuits: Mutex::new(HashMap::new()),
        }
    }

    fn circuit(&self, dependency: &DependencyName) -> Arc<Mutex<Circuit>> {
        let mut circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .entry(dependency.clone())
            .or_insert_with(|| Arc::new(Mutex::new(Circuit::new())))
            .clone()
    }

    /// Whether a call to this dependency is currently permitted.
    ///
    /// In the open state this also performs the Open → HalfOpen transition
    /// once the recovery timeout has elapsed; the caller that observes the
    /// transition owns the single trial slot.
    pub fn allow(&self, dependency: &DependencyName) -> bool {
        self.allow_at(dependency, Instant::now())
    }

    fn allow_at(&self, dependency: &DependencyName, now: Instant) -> bool {
        let circuit = self.circuit(dependency);
        let mut circuit = circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit.allow_at(now, &self.config, dependency)
    }

    /// Record a successful call. Resets the failure counter and closes the
    /// circuit from any state.
    pub fn record_success(&self, dependency: &DependencyName) {
        let circuit = self.circuit(dependency);
        let mut circuit = circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit.record_success(dependency);
    }

    /// Record a failed call.
    pub fn record_failure(&self, dependency: &DependencyName) {
        self.record_failure_at(dependency, Instant::now());
    }

    fn record_failure_at(&self, dependency: &DependencyName, now: Instant) {
        let circuit = self.circuit(dependency);
        let mut circuit = circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit.record_failure_at(now, &self.config, dependency);
    }

    /// Observable state for one dependency. Creates the circuit if it does
    /// not exist yet, so health reporting sees a closed circuit for
    /// dependencies that have never been called.
    pub fn snapshot(&self, dependency: &DependencyName) -> CircuitSnapshot {
        let circuit = self.circuit(dependency);
        let circuit = circuit.lock().unwrap_or_else(|e| e.into_inner());
        circuit.snapshot(dependency)
    }

    /// Snapshots for every dependency seen so far.
    pub fn snapshots(&self) -> Vec<CircuitSnapshot> {
        let circuits = self.circuits.lock().unwrap_or_else(|e| e.into_inner());
        circuits
            .iter()
            .map(|(name, circuit)| {
                let circuit = circuit.lock().unwrap_or_else(|e| e.into_inner());
                circuit.snapshot(name)
            })
            .collect()
    }

    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }
}
