//! Table of live allocation records.
//!
//! The registry itself is a plain single-owner structure. [`Tracker`](crate::Tracker)
//! wraps it in the one lock that also covers diagnostic emission, so every
//! mutation below happens while that lock is held.

use serde::Serialize;
use std::collections::HashMap;

use crate::error::TrackError;
use crate::output::serialize_address;

/// One outstanding tracked allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct AllocationRecord {
    #[serde(serialize_with = "serialize_address")]
    pub address: usize,
    pub size: usize,
    /// Assigned at insertion, starting at 1, never reused.
    pub id: u64,
}

/// Point-in-time view of the registry counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TrackerStats {
    /// Number of live records.
    pub active: usize,
    /// Sum of the sizes of all live records.
    pub active_bytes: usize,
    /// Bytes ever inserted. Never decreases.
    pub total_allocated: u64,
    /// Id the next successful insertion will receive.
    pub next_id: u64,
}

#[derive(Debug, Default)]
pub struct Registry {
    live: HashMap<usize, AllocationRecord>,
    last_id: u64,
    total_allocated: u64,
    active_bytes: usize,
    max_records: Option<usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that refuses insertions once `max_records` records are live.
    pub fn with_max_records(max_records: Option<usize>) -> Self {
        Self {
            max_records,
            ..Self::default()
        }
    }

    /// Records a new live allocation and returns its id.
    ///
    /// Fails without touching any counter when the record cannot be stored.
    pub fn insert(&mut self, address: usize, size: usize) -> Result<u64, TrackError> {
        debug_assert_ne!(address, 0, "null addresses are never tracked");

        if let Some(max) = self.max_records {
            if self.live.len() >= max && !self.live.contains_key(&address) {
                return Err(TrackError::RegistryFull(self.live.len()));
            }
        }
        self.live
            .try_reserve(1)
            .map_err(|_| TrackError::MetadataExhausted)?;

        self.last_id += 1;
        let record = AllocationRecord {
            address,
            size,
            id: self.last_id,
        };

        // A stale entry for the same address means the block was released
        // behind our back; the new record supersedes it.
        if let Some(stale) = self.live.insert(address, record) {
            self.active_bytes -= stale.size;
        }
        self.active_bytes += size;
        self.total_allocated += size as u64;

        Ok(record.id)
    }

    /// Removes the record for `address`. `None` means the address is not live.
    pub fn remove(&mut self, address: usize) -> Option<AllocationRecord> {
        let record = self.live.remove(&address)?;
        self.active_bytes -= record.size;
        Some(record)
    }

    #[cfg(test)]
    pub fn get(&self, address: usize) -> Option<&AllocationRecord> {
        self.live.get(&address)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn stats(&self) -> TrackerStats {
        TrackerStats {
            active: self.live.len(),
            active_bytes: self.active_bytes,
            total_allocated: self.total_allocated,
            next_id: self.last_id + 1,
        }
    }

    /// All live records, most recent first.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<AllocationRecord> = self.live.values().copied().collect();
        records.sort_unstable_by(|a, b| b.id.cmp(&a.id));
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_monotonic_and_never_reused() {
        let mut registry = Registry::new();
        assert_eq!(registry.insert(0x1000, 16), Ok(1));
        assert_eq!(registry.insert(0x2000, 32), Ok(2));
        assert!(registry.remove(0x1000).is_some());
        assert_eq!(registry.insert(0x1000, 8), Ok(3));
        assert_eq!(registry.stats().next_id, 4);
    }

    #[test]
    fn test_counters_follow_live_set() {
        let mut registry = Registry::new();
        registry.insert(0x10, 16).unwrap();
        registry.insert(0x20, 32).unwrap();
        registry.insert(0x30, 64).unwrap();

        let removed = registry.remove(0x20).unwrap();
        assert_eq!(removed.size, 32);
        assert_eq!(removed.id, 2);

        let stats = registry.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.active_bytes, 80);
        assert_eq!(stats.total_allocated, 112);

        let live_sum: usize = registry.snapshot().iter().map(|r| r.size).sum();
        assert_eq!(live_sum, stats.active_bytes);
        assert_eq!(registry.len(), stats.active);
    }

    #[test]
    fn test_remove_unknown_address() {
        let mut registry = Registry::new();
        registry.insert(0x10, 16).unwrap();
        assert!(registry.remove(0x99).is_none());
        assert!(registry.remove(0x10).is_some());
        assert!(registry.remove(0x10).is_none());
        assert_eq!(registry.stats().active, 0);
        assert_eq!(registry.stats().total_allocated, 16);
    }

    #[test]
    fn test_snapshot_is_most_recent_first() {
        let mut registry = Registry::new();
        for (i, address) in [0x30usize, 0x10, 0x20].into_iter().enumerate() {
            registry.insert(address, i + 1).unwrap();
        }
        let ids: Vec<u64> = registry.snapshot().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);
    }

    #[test]
    fn test_record_cap() {
        let mut registry = Registry::with_max_records(Some(2));
        registry.insert(0x10, 1).unwrap();
        registry.insert(0x20, 1).unwrap();
        assert_eq!(
            registry.insert(0x30, 1),
            Err(TrackError::RegistryFull(2))
        );
        let stats = registry.stats();
        assert_eq!(stats.active, 2);
        assert_eq!(stats.total_allocated, 2);
        assert_eq!(stats.next_id, 3);
    }

    #[test]
    fn test_reinserting_live_address_replaces_record() {
        let mut registry = Registry::new();
        registry.insert(0x10, 16).unwrap();
        registry.insert(0x10, 4).unwrap();
        let stats = registry.stats();
        assert_eq!(stats.active, 1);
        assert_eq!(stats.active_bytes, 4);
        assert_eq!(registry.get(0x10).map(|r| r.id), Some(2));
    }
}
