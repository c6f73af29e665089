//! Model pricing table and cost model.
//!
//! Rates are USD per million tokens. The table is plain configuration data: it
//! deserializes from `{"model": {"input": 0.5, "output": 1.5}, "default": {...}}`.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::types::TokenUsage;

/// Key of the wildcard entry used for unknown models.
pub const DEFAULT_PRICING_KEY: &str = "default";

const TOKENS_PER_MILLION: f64 = 1_000_000.0;

/// Input/output rates for one model, in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelRates {
    pub input: f64,
    pub output: f64,
}

impl ModelRates {
    pub const fn new(input: f64, output: f64) -> Self {
        Self { input, output }
    }

    /// Cost in USD for the given usage at these rates.
    pub fn cost(&self, usage: &TokenUsage) -> f64 {
        (usage.prompt_tokens as f64 / TOKENS_PER_MILLION) * self.input
            + (usage.completion_tokens as f64 / TOKENS_PER_MILLION) * self.output
    }
}

// gpt-4-turbo: $10.00/1M input, $30.00/1M output
// gpt-3.5-turbo: $0.50/1M input, $1.50/1M output
const GPT_4_TURBO: ModelRates = ModelRates::new(10.0, 30.0);
const GPT_35_TURBO: ModelRates = ModelRates::new(0.50, 1.50);

/// Applied when the table has neither the model nor a `default` entry.
pub const FALLBACK_RATES: ModelRates = GPT_35_TURBO;

/// Per-model rates plus a wildcard `default`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PricingTable {
    rates: HashMap<String, ModelRates>,
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut rates = HashMap::new();
        rates.insert("gpt-4-turbo".to_string(), GPT_4_TURBO);
        rates.insert("gpt-3.5-turbo".to_string(), GPT_35_TURBO);
        rates.insert(DEFAULT_PRICING_KEY.to_string(), GPT_35_TURBO);
        Self { rates }
    }
}

impl PricingTable {
    pub fn empty() -> Self {
        Self {
            rates: HashMap::new(),
        }
    }

    pub fn with_rates(mut self, model: impl Into<String>, rates: ModelRates) -> Self {
        self.rates.insert(model.into(), rates);
        self
    }

    /// Rates for `model`, falling back to the `default` entry, then to [`FALLBACK_RATES`].
    pub fn rates_for(&self, model: &str) -> ModelRates {
        self.rates
            .get(model)
            .or_else(|| self.rates.get(DEFAULT_PRICING_KEY))
            .copied()
            .unwrap_or(FALLBACK_RATES)
    }

    /// Cost in USD of `usage` on `model`.
    pub fn cost(&self, usage: &TokenUsage, model: &str) -> f64 {
        self.rates_for(model).cost(usage)
    }
}
