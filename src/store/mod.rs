//! Durable build state: build records, the append-only build log, and the
//! cost ledger.

pub mod file;
pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::build::{Build, BuildId, BuildLogEntry};
use crate::config::ModelPrice;
use crate::provider::TokenUsage;

pub use file::FileStore;
pub use memory::MemoryStore;

/// In-place mutation applied atomically by [`BuildStore::update`].
pub type BuildMutation = Box<dyn FnOnce(&mut Build) + Send>;

#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn create(&self, build: &Build) -> Result<()>;

    async fn get(&self, id: BuildId) -> Result<Option<Build>>;

    async fn list(&self) -> Result<Vec<Build>>;

    /// Apply `mutation` and persist the result. `None` when the build does
    /// not exist.
    async fn update(&self, id: BuildId, mutation: BuildMutation) -> Result<Option<Build>>;

    async fn append_log(&self, id: BuildId, entry: BuildLogEntry) -> Result<()>;

    async fn logs(&self, id: BuildId) -> Result<Vec<BuildLogEntry>>;
}

/// One ledger row: a phase or a remediation sub-step.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CostEntry {
    pub build_id: BuildId,
    pub phase_label: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub model: String,
    pub cost_usd: f64,
    pub recorded_at: DateTime<Utc>,
}

impl CostEntry {
    pub fn new(
        build_id: BuildId,
        phase_label: impl Into<String>,
        model: impl Into<String>,
        usage: TokenUsage,
        price: ModelPrice,
    ) -> Self {
        Self {
            build_id,
            phase_label: phase_label.into(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            model: model.into(),
            cost_usd: estimate_cost(usage, price),
            recorded_at: Utc::now(),
        }
    }
}

/// USD cost of `usage` at `price`.
pub fn estimate_cost(usage: TokenUsage, price: ModelPrice) -> f64 {
    (usage.input_tokens as f64 * price.input_per_mtok
        + usage.output_tokens as f64 * price.output_per_mtok)
        / 1_000_000.0
}

#[async_trait]
pub trait CostLedger: Send + Sync {
    async fn record(&self, entry: CostEntry) -> Result<()>;

    async fn entries(&self, build_id: BuildId) -> Result<Vec<CostEntry>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_cost() {
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 200_000,
        };
        let price = ModelPrice {
            input_per_mtok: 3.0,
            output_per_mtok: 15.0,
        };
        assert!((estimate_cost(usage, price) - 6.0).abs() < 1e-9);
    }
}
