//! Per-subject counters shared by every handler invocation.
//!
//! Uses `DashMap` so increments only contend within one shard, and
//! [`AggregationTable::snapshot`] locks one shard at a time instead of the
//! whole table.

use dashmap::DashMap;

/// Concurrent key → count table
///
/// Entries are created on first increment and live until the table is
/// dropped.
#[derive(Debug, Default)]
pub struct AggregationTable {
    counters: DashMap<u64, u64>,
}

impl AggregationTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one to `key`, creating it at zero first; returns the new count
    pub fn increment(&self, key: u64) -> u64 {
        let mut count = self.counters.entry(key).or_insert(0);
        *count += 1;
        *count
    }

    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        self.counters.get(&key).map(|count| *count)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.counters.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
    }

    /// Copy of every counter, ordered by key
    ///
    /// Increments racing with the copy may or may not be included, but any
    /// increment that completed before the call is.
    #[must_use]
    pub fn snapshot(&self) -> Snapshot {
        let mut entries: Vec<(u64, u64)> =
            self.counters.iter().map(|entry| (*entry.key(), *entry.value())).collect();
        entries.sort_unstable_by_key(|&(key, _)| key);
        Snapshot { entries }
    }
}

/// Point-in-time copy of an [`AggregationTable`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: Vec<(u64, u64)>,
}

impl Snapshot {
    #[must_use]
    pub fn get(&self, key: u64) -> Option<u64> {
        self.entries
            .binary_search_by_key(&key, |&(k, _)| k)
            .ok()
            .map(|index| self.entries[index].1)
    }

    /// `(key, count)` pairs in ascending key order
    #[must_use]
    pub fn entries(&self) -> &[(u64, u64)] {
        &self.entries
    }

    #[must_use]
    pub fn total(&self) -> u64 {
        self.entries.iter().map(|&(_, count)| count).sum()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a (u64, u64);
    type IntoIter = std::slice::Iter<'a, (u64, u64)>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_increment_creates_entry() {
        let table = AggregationTable::new();
        assert_eq!(table.get(501), None);
        assert_eq!(table.increment(501), 1);
        assert_eq!(table.increment(501), 2);
        assert_eq!(table.get(501), Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_snapshot_is_ordered() {
        let table = AggregationTable::new();
        for key in [1000, 0, 501, 0] {
            table.increment(key);
        }
        let snapshot = table.snapshot();
        assert_eq!(snapshot.entries(), &[(0, 2), (501, 1), (1000, 1)]);
        assert_eq!(snapshot.get(0), Some(2));
        assert_eq!(snapshot.get(7), None);
        assert_eq!(snapshot.total(), 4);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let table = AggregationTable::new();
        table.increment(1);
        let snapshot = table.snapshot();
        table.increment(1);
        assert_eq!(snapshot.get(1), Some(1));
        assert_eq!(table.get(1), Some(2));
    }

    #[test]
    fn test_concurrent_increments() {
        let table = Arc::new(AggregationTable::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = Arc::clone(&table);
                std::thread::spawn(move || {
                    for _ in 0..125 {
                        table.increment(42);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(table.snapshot().get(42), Some(1000));
    }

    #[test]
    fn test_snapshot_during_increments_is_monotonic() {
        let table = Arc::new(AggregationTable::new());
        let writer = {
            let table = Arc::clone(&table);
            std::thread::spawn(move || {
                for i in 0..20_000u64 {
                    table.increment(i % 16);
                }
            })
        };

        let mut last_total = 0;
        while !writer.is_finished() {
            let total = table.snapshot().total();
            assert!(total >= last_total, "snapshot went backwards: {total} < {last_total}");
            last_total = total;
        }
        writer.join().unwrap();
        assert_eq!(table.snapshot().total(), 20_000);
    }
}
