//! Shutdown leak summary.

use serde::Serialize;

use crate::registry::AllocationRecord;

/// Allocations still live when the tracker shut down.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename = "leak-report")]
pub struct LeakReport {
    leak_count: usize,
    total_bytes: u64,
    /// Most recent first.
    leaks: Vec<AllocationRecord>,
}

impl LeakReport {
    /// Builds the summary from a registry snapshot (most recent first).
    pub fn from_records(leaks: Vec<AllocationRecord>) -> Self {
        debug_assert!(leaks.windows(2).all(|pair| pair[0].id > pair[1].id));

        let total_bytes = leaks.iter().map(|record| record.size as u64).sum();
        Self {
            leak_count: leaks.len(),
            total_bytes,
            leaks,
        }
    }

    pub fn is_clean(&self) -> bool {
        self.leaks.is_empty()
    }

    pub fn leak_count(&self) -> usize {
        self.leak_count
    }

    pub fn total_bytes(&self) -> u64 {
        self.total_bytes
    }

    pub fn leaks(&self) -> &[AllocationRecord] {
        &self.leaks
    }
}
