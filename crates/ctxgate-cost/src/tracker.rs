use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use time::OffsetDateTime;

use ctxgate_common::CostCaps;

use crate::ledger::{CostDirection, CostEntry};
use crate::pricing::PricingTable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Allowed,
    /// Which cap tripped, for the provider-native error message.
    Denied { cap: &'static str },
}

/// Per-request cost accounting with session and global hard ceilings.
///
/// Running totals are micro-USD atomics so concurrent request tasks can add
/// without a lock; the append-only ledger sits behind a mutex and is only
/// touched once per request, after the terminal usage frame.
pub struct CostTracker {
    pricing: PricingTable,
    caps: CostCaps,
    session_micro_usd: AtomicU64,
    global_micro_usd: AtomicU64,
    entries: Mutex<Vec<CostEntry>>,
}

impl CostTracker {
    pub fn new(caps: CostCaps) -> Self {
        Self {
            pricing: PricingTable::new(),
            caps,
            session_micro_usd: AtomicU64::new(0),
            global_micro_usd: AtomicU64::new(0),
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Seeds the global total with spend accumulated by earlier sessions.
    pub fn with_global_baseline(caps: CostCaps, baseline_usd: f64) -> Self {
        let tracker = Self::new(caps);
        tracker
            .global_micro_usd
            .store(to_micro(baseline_usd), Ordering::Relaxed);
        tracker
    }

    pub fn pricing(&self) -> &PricingTable {
        &self.pricing
    }

    /// Caps act as hard ceilings on accumulated spend; the projected cost of
    /// the pending request is not consulted.
    pub fn admit(&self) -> Admission {
        let session = self.session_micro_usd.load(Ordering::Relaxed);
        if cap_reached(session, self.caps.session_cap_usd) {
            return Admission::Denied { cap: "session" };
        }
        let global = self.global_micro_usd.load(Ordering::Relaxed);
        if cap_reached(global, self.caps.global_cap_usd) {
            return Admission::Denied { cap: "global" };
        }
        Admission::Allowed
    }

    #[allow(clippy::too_many_arguments)]
    pub fn record(
        &self,
        provider: &str,
        model: &str,
        input_tokens: u64,
        output_tokens: u64,
        cache_read_tokens: u64,
        cache_write_tokens: u64,
        direction: CostDirection,
        estimated: bool,
    ) -> CostEntry {
        let price = self.pricing.price(model);
        let cost_usd = price.cost_usd(
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
        );
        let entry = CostEntry {
            timestamp: OffsetDateTime::now_utc(),
            model: model.to_string(),
            provider: provider.to_string(),
            input_tokens,
            output_tokens,
            cache_read_tokens,
            cache_write_tokens,
            cost_usd,
            direction,
            estimated,
        };
        let micro = to_micro(cost_usd);
        self.session_micro_usd.fetch_add(micro, Ordering::Relaxed);
        self.global_micro_usd.fetch_add(micro, Ordering::Relaxed);
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(entry.clone());
        }
        entry
    }

    pub fn session_total_usd(&self) -> f64 {
        from_micro(self.session_micro_usd.load(Ordering::Relaxed))
    }

    pub fn global_total_usd(&self) -> f64 {
        from_micro(self.global_micro_usd.load(Ordering::Relaxed))
    }

    pub fn caps(&self) -> CostCaps {
        self.caps
    }

    pub fn entries(&self) -> Vec<CostEntry> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

fn cap_reached(total_micro: u64, cap_usd: f64) -> bool {
    cap_usd > 0.0 && total_micro >= to_micro(cap_usd)
}

fn to_micro(usd: f64) -> u64 {
    if usd <= 0.0 {
        return 0;
    }
    (usd * 1_000_000.0).round() as u64
}

fn from_micro(micro: u64) -> f64 {
    micro as f64 / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn caps(session: f64, global: f64) -> CostCaps {
        CostCaps {
            session_cap_usd: session,
            global_cap_usd: global,
        }
    }

    #[test]
    fn zero_cap_means_unlimited() {
        let tracker = CostTracker::new(caps(0.0, 0.0));
        tracker.record("anthropic", "claude-opus-4-6", 1_000_000, 1_000_000, 0, 0,
            CostDirection::Inference, false);
        assert_eq!(tracker.admit(), Admission::Allowed);
    }

    #[test]
    fn session_cap_denies_once_reached() {
        let tracker = CostTracker::new(caps(0.02, 0.0));
        assert_eq!(tracker.admit(), Admission::Allowed);
        tracker.record("anthropic", "claude-sonnet-4-5", 2000, 500, 5000, 2000,
            CostDirection::Inference, false);
        assert_eq!(tracker.admit(), Admission::Denied { cap: "session" });
    }

    #[test]
    fn global_baseline_counts_toward_global_cap() {
        let tracker = CostTracker::with_global_baseline(caps(0.0, 5.0), 5.0);
        assert_eq!(tracker.admit(), Admission::Denied { cap: "global" });
    }

    #[test]
    fn ledger_sum_matches_cached_total() {
        let tracker = CostTracker::new(caps(0.0, 0.0));
        tracker.record("anthropic", "claude-sonnet-4-5", 2000, 500, 5000, 2000,
            CostDirection::Inference, false);
        tracker.record("openai", "gpt-5", 1000, 1000, 0, 0, CostDirection::Inference, false);
        tracker.record("anthropic", "claude-opus-4-6-20260101", 1000, 1000, 0, 0,
            CostDirection::Maintenance, false);
        let ledger_sum: f64 = tracker.entries().iter().map(|e| e.cost_usd).sum();
        assert!((ledger_sum - tracker.session_total_usd()).abs() < 1e-4);
    }

    #[test]
    fn counters_update_once_per_record() {
        let tracker = CostTracker::new(caps(0.0, 0.0));
        let entry = tracker.record("anthropic", "claude-opus-4-6-20260101", 1000, 1000, 0, 0,
            CostDirection::Inference, false);
        assert!((entry.cost_usd - 0.030).abs() < 1e-9);
        assert!((tracker.session_total_usd() - 0.030).abs() < 1e-6);
        assert!((tracker.global_total_usd() - 0.030).abs() < 1e-6);
    }
}
