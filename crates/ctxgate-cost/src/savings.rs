use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Bytes the pipes and the compactor kept out of the context window.
/// Read by the status reporter; written from request tasks.
#[derive(Debug, Default)]
pub struct SavingsTracker {
    tool_output_bytes: AtomicU64,
    tool_discovery_bytes: AtomicU64,
    compaction_bytes: AtomicU64,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct SavingsSnapshot {
    pub tool_output_bytes: u64,
    pub tool_discovery_bytes: u64,
    pub compaction_bytes: u64,
    pub total_bytes: u64,
}

impl SavingsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_tool_output(&self, bytes: u64) {
        self.tool_output_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_tool_discovery(&self, bytes: u64) {
        self.tool_discovery_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_compaction(&self, bytes: u64) {
        self.compaction_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SavingsSnapshot {
        let tool_output = self.tool_output_bytes.load(Ordering::Relaxed);
        let tool_discovery = self.tool_discovery_bytes.load(Ordering::Relaxed);
        let compaction = self.compaction_bytes.load(Ordering::Relaxed);
        SavingsSnapshot {
            tool_output_bytes: tool_output,
            tool_discovery_bytes: tool_discovery,
            compaction_bytes: compaction,
            total_bytes: tool_output + tool_discovery + compaction,
        }
    }
}
