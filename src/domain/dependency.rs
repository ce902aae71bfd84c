//! Dependency identity and classification.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier for an external collaborator (an LLM provider, a social
/// platform, a webhook receiver).
///
/// Circuit and retry state are scoped per dependency name, so two
/// dependencies never share failure counters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DependencyName(String);

impl DependencyName {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DependencyName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DependencyName {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for DependencyName {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Class of dependency call, used to select retry defaults.
///
/// Generation calls are expensive and slow; publish calls hit rate-limited
/// platform APIs; webhook deliveries go to arbitrary receivers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyClass {
    Generation,
    Publish,
    WebhookDelivery,
}
