use crate::config::PricingConfig;
use crate::protocol::canonical::{Cost, Model, Usage};
use rustc_hash::FxHashMap;

/// Turns finalized token counts into money. Called once per stream.
pub trait CostCalculator: Send + Sync {
    fn calculate(&self, model: &Model, usage: &Usage) -> Cost;
}

/// Prices in currency units per million tokens.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ModelPricing {
    pub input_per_mtok: f64,
    pub output_per_mtok: f64,
    pub cache_read_per_mtok: f64,
    pub cache_write_per_mtok: f64,
}

/// Per-model price table. Unknown models cost nothing.
#[derive(Debug, Clone, Default)]
pub struct PricingTable {
    prices: FxHashMap<String, ModelPricing>,
}

impl PricingTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn from_config(entries: &[PricingConfig]) -> Self {
        let mut table = Self::new();
        for entry in entries {
            table.insert(
                &entry.model,
                ModelPricing {
                    input_per_mtok: entry.input,
                    output_per_mtok: entry.output,
                    cache_read_per_mtok: entry.cache_read,
                    cache_write_per_mtok: entry.cache_write,
                },
            );
        }
        table
    }

    pub fn insert(&mut self, model: &str, pricing: ModelPricing) {
        self.prices.insert(model.to_owned(), pricing);
    }

    #[must_use]
    pub fn get(&self, model: &str) -> Option<&ModelPricing> {
        self.prices.get(model)
    }
}

#[allow(clippy::cast_precision_loss)]
fn per_million(tokens: u64, price: f64) -> f64 {
    (tokens as f64 / 1_000_000.0) * price
}

impl CostCalculator for PricingTable {
    fn calculate(&self, model: &Model, usage: &Usage) -> Cost {
        let Some(pricing) = self.get(&model.id) else {
            return Cost::default();
        };
        let input = per_million(usage.input, pricing.input_per_mtok);
        let output = per_million(usage.output, pricing.output_per_mtok);
        let cache_read = per_million(usage.cache_read, pricing.cache_read_per_mtok);
        let cache_write = per_million(usage.cache_write, pricing.cache_write_per_mtok);
        Cost {
            input,
            output,
            cache_read,
            cache_write,
            total: input + output + cache_read + cache_write,
        }
    }
}
