//! Token pricing for cost estimation
//!
//! The aggregator never prices anything itself; it only sums the `cost_usd`
//! (or `cost`) metadata it is given. Callers use this module to compute that
//! value from token counts before ending a span:
//!
//! ```rust
//! use convo_metrics::pricing::PricingTable;
//!
//! let table = PricingTable::default();
//! let cost = table.estimate_cost("deepseek-chat", 1_000_000, 500_000).unwrap();
//! assert!((cost - 0.28).abs() < 1e-9);
//! ```

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::record::{Metadata, MetadataValue};

/// Model that the default table prices
pub const DEFAULT_MODEL: &str = "deepseek-chat";

/// Price of one model in USD per million tokens
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

impl ModelPricing {
    pub fn new(input_per_million: f64, output_per_million: f64) -> Self {
        Self {
            input_per_million,
            output_per_million,
        }
    }

    pub fn estimate_cost(&self, input_tokens: u64, output_tokens: u64) -> f64 {
        (input_tokens as f64 * self.input_per_million
            + output_tokens as f64 * self.output_per_million)
            / 1_000_000.0
    }
}

/// Prices keyed by model name
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingTable {
    models: HashMap<String, ModelPricing>,
}

impl PricingTable {
    /// A table with no models
    pub fn empty() -> Self {
        Self {
            models: HashMap::new(),
        }
    }

    pub fn add_model(&mut self, model: impl Into<String>, pricing: ModelPricing) {
        self.models.insert(model.into(), pricing);
    }

    pub fn get_pricing(&self, model: &str) -> Option<&ModelPricing> {
        self.models.get(model)
    }

    /// `None` for unpriced models
    pub fn estimate_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.models
            .get(model)
            .map(|p| p.estimate_cost(input_tokens, output_tokens))
    }

    /// Span metadata describing one model call: model, token counts and cost
    ///
    /// The cost entry is omitted for unpriced models.
    pub fn usage_metadata(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Metadata {
        let mut meta = Metadata::new();
        meta.insert("model".to_string(), MetadataValue::from(model));
        meta.insert("input_tokens".to_string(), MetadataValue::from(input_tokens));
        meta.insert("output_tokens".to_string(), MetadataValue::from(output_tokens));
        meta.insert(
            "total_tokens".to_string(),
            MetadataValue::from(input_tokens.saturating_add(output_tokens)),
        );
        if let Some(cost) = self.estimate_cost(model, input_tokens, output_tokens) {
            meta.insert("cost_usd".to_string(), MetadataValue::from(cost));
        }
        meta
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        let mut table = Self::empty();
        table.add_model(DEFAULT_MODEL, ModelPricing::new(0.14, 0.28));
        table
    }
}
