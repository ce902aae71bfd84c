//! Domain types for the orchestration layer.
//!
//! This module contains the shared vocabulary:
//! - Dependency: identity and class of external collaborators
//! - Failure: attempt classification and the terminal call taxonomy
//! - Cost: usage samples and the model pricing table

pub mod cost;
pub mod dependency;
pub mod failure;

// Re-export commonly used types
pub use cost::{CostSample, CostTable, ModelPricing};
pub use dependency::{DependencyClass, DependencyName};
pub use failure::{classify_status, AttemptError, CallError, FailureKind, LimitKind};
