//! Cost accounting vocabulary.
//!
//! Usage is measured in units (tokens for generation calls, one unit per
//! publish call) and US dollars. Estimates are reserved before a paid call;
//! the actual sample reported afterwards corrects the ledger.

use serde::{Deserialize, Serialize};

/// A usage sample: units consumed plus dollar cost.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostSample {
    pub units: u64,
    pub cost_usd: f64,
}

impl CostSample {
    pub fn new(units: u64, cost_usd: f64) -> Self {
        Self { units, cost_usd }
    }

    /// A free call (cache hits, health probes).
    pub fn zero() -> Self {
        Self::default()
    }
}

/// Per-model pricing, dollars per 1000 tokens, input and output priced
/// separately.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
}

/// Cost table for generation models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostTable {
    #[serde(default = "default_models")]
    pub models: std::collections::HashMap<String, ModelPricing>,

    /// Applied when a model has no entry in the table.
    #[serde(default = "default_fallback")]
    pub fallback: ModelPricing,
}

fn default_models() -> std::collections::HashMap<String, ModelPricing> {
    [
        (
            "gpt-4-turbo-preview".to_string(),
            ModelPricing {
                input_per_1k: 0.01,
                output_per_1k: 0.03,
            },
        ),
        (
            "gpt-3.5-turbo".to_string(),
            ModelPricing {
                input_per_1k: 0.0005,
                output_per_1k: 0.0015,
            },
        ),
    ]
    .into_iter()
    .collect()
}

fn default_fallback() -> ModelPricing {
    ModelPricing {
        input_per_1k: 0.01,
        output_per_1k: 0.03,
    }
}

impl Default for CostTable {
    fn default() -> Self {
        Self {
            models: default_models(),
            fallback: default_fallback(),
        }
    }
}

impl CostTable {
    /// Cost of a generation call given token counts.
    pub fn cost_for_tokens(&self, model: &str, input_tokens: u64, output_tokens: u64) -> CostSample {
        let pricing = self.models.get(model).copied().unwrap_or(self.fallback);

        let cost = pricing.input_per_1k * (input_tokens as f64 / 1000.0)
            + pricing.output_per_1k * (output_tokens as f64 / 1000.0);

        CostSample::new(input_tokens + output_tokens, cost)
    }

    /// Pre-call estimate from an expected total token count, split evenly
    /// between input and output.
    pub fn estimate(&self, model: &str, expected_tokens: u64) -> CostSample {
        self.cost_for_tokens(model, expected_tokens / 2, expected_tokens - expected_tokens / 2)
    }
}
