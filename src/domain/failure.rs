//! Failure taxonomy for external calls.
//!
//! Every attempt against a dependency resolves to success or an
//! [`AttemptError`] classified as retryable or fatal. The composed call path
//! surfaces terminal outcomes as [`CallError`] variants; none of them are
//! fatal to the process.

use thiserror::Error;

use super::dependency::DependencyName;

/// How an attempt failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Transient, dependency-side: timeout, 429, 5xx, connection reset.
    /// Retried up to the attempt budget.
    Retryable,

    /// Caller error: 4xx other than 429, validation failure. Never retried.
    Fatal,
}

/// A single failed attempt against a dependency.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct AttemptError {
    pub kind: FailureKind,
    pub message: String,

    /// HTTP status, when the failure came from a response.
    pub status: Option<u16>,
}

impl AttemptError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: message.into(),
            status: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Fatal,
            message: message.into(),
            status: None,
        }
    }

    /// An attempt that exceeded its hard timeout.
    pub fn timed_out(dependency: &DependencyName) -> Self {
        Self {
            kind: FailureKind::Retryable,
            message: format!("attempt against {} timed out", dependency),
            status: None,
        }
    }

    /// Classify a non-success HTTP status code.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        Self {
            kind: classify_status(status),
            message: message.into(),
            status: Some(status),
        }
    }

    /// Classify a transport-level error from reqwest. Connection failures
    /// and timeouts are retryable; request-building errors are not.
    pub fn from_reqwest(err: &reqwest::Error) -> Self {
        let kind = if err.is_builder() || err.is_request() && !err.is_timeout() && !err.is_connect()
        {
            FailureKind::Fatal
        } else {
            FailureKind::Retryable
        };

        Self {
            kind,
            message: err.to_string(),
            status: err.status().map(|s| s.as_u16()),
        }
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == FailureKind::Retryable
    }
}

/// Classify an HTTP status code: 429 and 5xx are transient, other 4xx are
/// caller errors.
pub fn classify_status(status: u16) -> FailureKind {
    match status {
        429 => FailureKind::Retryable,
        500..=599 => FailureKind::Retryable,
        _ => FailureKind::Fatal,
    }
}

/// Which configured usage limit a rejected call would have exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKind {
    DailyRequests,
    DailyUnits,
    DailyCost,
    MonthlyRequests,
    MonthlyUnits,
    MonthlyCost,
}

impl std::fmt::Display for LimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::DailyRequests => "daily_requests",
            Self::DailyUnits => "daily_units",
            Self::DailyCost => "daily_cost",
            Self::MonthlyRequests => "monthly_requests",
            Self::MonthlyUnits => "monthly_units",
            Self::MonthlyCost => "monthly_cost",
        };
        f.write_str(s)
    }
}

/// Terminal outcome of a composed call.
#[derive(Debug, Error)]
pub enum CallError {
    /// The circuit for this dependency is open; the call was rejected
    /// without touching the network.
    #[error("circuit open for {0}, call rejected")]
    CircuitOpen(DependencyName),

    /// A configured usage limit would be exceeded; the call was rejected
    /// before the dependency was invoked.
    #[error("usage limit exceeded for {identity}: {}", format_limits(.exceeded))]
    LimitExceeded {
        identity: String,
        exceeded: Vec<LimitKind>,
    },

    /// The retry budget ran out; carries the last underlying error.
    #[error("{dependency}: retries exhausted after {attempts} attempts")]
    Exhausted {
        dependency: DependencyName,
        attempts: u32,
        #[source]
        last: AttemptError,
    },

    /// A fatal failure; the call was attempted at most once.
    #[error("{dependency}: fatal failure")]
    Fatal {
        dependency: DependencyName,
        #[source]
        source: AttemptError,
    },

    /// A persisted store (usage journal, delivery log) could not be
    /// read or written.
    #[error("storage error: {0}")]
    Storage(String),
}

fn format_limits(exceeded: &[LimitKind]) -> String {
    exceeded
        .iter()
        .map(|l| l.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
