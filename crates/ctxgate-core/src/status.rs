use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::Serialize;
use tracing::debug;

use ctxgate_cost::{CostTracker, SavingsTracker};
use ctxgate_pipes::{CompresrClient, GatewayStatus};

const REFRESH_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone, Serialize, Default)]
pub struct StatusSnapshot {
    pub tier: Option<String>,
    pub credits_remaining_usd: Option<f64>,
    pub session_cost_usd: f64,
    pub global_cap_usd: f64,
    pub savings_bytes: u64,
}

/// Read-side of `/api/status`: holds shared references to the cost and
/// savings sources and a periodically refreshed hosted-subscription view.
pub struct StatusReporter {
    cost: Arc<CostTracker>,
    savings: Arc<SavingsTracker>,
    compresr: Option<Arc<CompresrClient>>,
    hosted: ArcSwap<GatewayStatus>,
}

impl StatusReporter {
    pub fn new(
        cost: Arc<CostTracker>,
        savings: Arc<SavingsTracker>,
        compresr: Option<Arc<CompresrClient>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            cost,
            savings,
            compresr,
            hosted: ArcSwap::from_pointee(GatewayStatus::default()),
        })
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let hosted = self.hosted.load();
        StatusSnapshot {
            tier: hosted.tier.clone(),
            credits_remaining_usd: hosted.credits_remaining_usd,
            session_cost_usd: self.cost.session_total_usd(),
            global_cap_usd: self.cost.caps().global_cap_usd,
            savings_bytes: self.savings.snapshot().total_bytes,
        }
    }

    /// Periodic hosted-status refresh; a no-op without a compresr key.
    pub fn spawn_refresh(self: &Arc<Self>) {
        let Some(client) = self.compresr.clone() else {
            return;
        };
        let reporter = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                match client.gateway_status().await {
                    Ok(status) => {
                        reporter.hosted.store(Arc::new(status));
                    }
                    Err(err) => {
                        debug!(event = "status.refresh_failed", error = %err);
                    }
                }
                tokio::time::sleep(Duration::from_secs(REFRESH_INTERVAL_SECS)).await;
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctxgate_common::CostCaps;
    use ctxgate_cost::CostDirection;

    #[test]
    fn snapshot_reads_cost_sources() {
        let cost = Arc::new(CostTracker::new(CostCaps {
            session_cap_usd: 0.0,
            global_cap_usd: 25.0,
        }));
        cost.record("anthropic", "claude-opus-4-6", 1000, 1000, 0, 0,
            CostDirection::Inference, false);
        let savings = Arc::new(SavingsTracker::new());
        savings.add_compaction(512);
        let reporter = StatusReporter::new(cost, savings, None);
        let snapshot = reporter.snapshot();
        assert!((snapshot.session_cost_usd - 0.030).abs() < 1e-6);
        assert_eq!(snapshot.global_cap_usd, 25.0);
        assert_eq!(snapshot.savings_bytes, 512);
    }
}
