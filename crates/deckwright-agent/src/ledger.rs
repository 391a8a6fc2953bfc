use crate::config::{ModelPrice, PricingTable};
use deckwright_core::UsageRecord;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;

/// Accumulated usage for one model.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelUsage {
    pub calls: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub reasoning_tokens: u64,
    pub cost_usd: f64,
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct LedgerSnapshot {
    pub models: BTreeMap<String, ModelUsage>,
    pub total_calls: u64,
    pub total_cost_usd: f64,
    /// What the same traffic would have cost on the reference model, minus
    /// the actual cost. `None` without a priced reference model.
    pub savings_usd: Option<f64>,
}

#[derive(Default)]
struct LedgerState {
    models: BTreeMap<String, ModelUsage>,
    reference_cost_usd: f64,
}

/// Process-wide cost accounting shared by concurrent requests.
///
/// Each [`record`](CostLedger::record) is a single critical section, so
/// concurrent increments are never lost.
pub struct CostLedger {
    pricing: PricingTable,
    state: Mutex<LedgerState>,
}

impl CostLedger {
    pub fn new(pricing: PricingTable) -> Self {
        Self {
            pricing,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Records one call. Unpriced models are counted at zero cost.
    pub fn record(&self, model: &str, usage: &UsageRecord) {
        let cost = self
            .pricing
            .models
            .get(model)
            .map_or(0.0, |price| cost_of(price, usage));
        let reference_cost = self.reference_price().map(|price| cost_of(price, usage));

        let mut state = self.state.lock();
        let entry = state.models.entry(model.to_string()).or_default();
        entry.calls += 1;
        entry.input_tokens += usage.input_tokens;
        entry.output_tokens += usage.output_tokens;
        entry.reasoning_tokens += usage.reasoning_tokens;
        entry.cost_usd += cost;
        if let Some(reference_cost) = reference_cost {
            state.reference_cost_usd += reference_cost;
        }
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock();
        let total_calls = state.models.values().map(|m| m.calls).sum();
        let total_cost_usd: f64 = state.models.values().map(|m| m.cost_usd).sum();
        LedgerSnapshot {
            models: state.models.clone(),
            total_calls,
            total_cost_usd,
            savings_usd: self
                .reference_price()
                .map(|_| state.reference_cost_usd - total_cost_usd),
        }
    }

    fn reference_price(&self) -> Option<&ModelPrice> {
        self.pricing
            .reference_model
            .as_ref()
            .and_then(|m| self.pricing.models.get(m))
    }
}

fn cost_of(price: &ModelPrice, usage: &UsageRecord) -> f64 {
    let input = usage.input_tokens as f64 / 1_000_000.0 * price.input_per_million;
    let output = usage.billable_output() as f64 / 1_000_000.0 * price.output_per_million;
    input + output
}
