use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;

/// Aggregated daily spend per project, as reported by an external
/// cost-polling collaborator. The engine only consumes the number; how it
/// is fetched (provider APIs, caching, backoff) lives outside the core.
#[async_trait]
pub trait CostProvider: Send + Sync {
    async fn daily_cost(&self, project: &str) -> anyhow::Result<f64>;
}

/// In-memory provider: fixed figures, settable at runtime. Used in tests
/// and as the default when no external poller is wired in.
#[derive(Default)]
pub struct FixedCostProvider {
    costs: RwLock<HashMap<String, f64>>,
}

impl FixedCostProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, project: &str, amount_usd: f64) {
        self.costs.write().insert(project.to_string(), amount_usd);
    }
}

#[async_trait]
impl CostProvider for FixedCostProvider {
    async fn daily_cost(&self, project: &str) -> anyhow::Result<f64> {
        Ok(self.costs.read().get(project).copied().unwrap_or(0.0))
    }
}
