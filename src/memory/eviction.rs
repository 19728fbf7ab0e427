//! Global eviction order over all live segments, least recently used first.

use std::collections::BTreeSet;

use super::clock::Timestamp;
use super::registry::SegmentKey;

/// Ordered by `(last_used, key)`. The key breaks ties so equal timestamps
/// never collapse two segments into one entry.
#[derive(Debug, Default)]
pub struct EvictionOrder {
    entries: BTreeSet<(Timestamp, SegmentKey)>,
}

impl EvictionOrder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, last_used: Timestamp, key: SegmentKey) {
        let inserted = self.entries.insert((last_used, key));
        assert!(inserted, "segment {key} queued twice for eviction");
    }

    /// Remove an entry that must be present.
    pub fn remove(&mut self, last_used: Timestamp, key: SegmentKey) {
        let removed = self.entries.remove(&(last_used, key));
        assert!(removed, "segment {key} missing from eviction order");
    }

    /// Least recently used entry, if any.
    pub fn peek(&self) -> Option<(Timestamp, SegmentKey)> {
        self.entries.first().copied()
    }

    pub fn pop(&mut self) -> Option<(Timestamp, SegmentKey)> {
        self.entries.pop_first()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[cfg(test)]
    pub fn contains(&self, last_used: Timestamp, key: SegmentKey) -> bool {
        self.entries.contains(&(last_used, key))
    }
}
