//! The "HISTORY" Engine - Versioned Change Log
//!
//! Records one change set per grid update cycle and lets any number of
//! consumers catch up with "everything changed since version V" without
//! re-scanning the grid.
//!
//! Storage is a fixed array of `capacity` slots indexed by
//! `(version - 1) % capacity`, so appending version `v` overwrites exactly
//! version `v - capacity`: FIFO eviction is a property of the layout.

use std::collections::HashSet;
use std::hash::Hash;
use std::sync::RwLock;

/// Set of items (voxel or chunk keys) mutated during one update cycle.
pub type ChangeSet<T> = HashSet<T>;

#[derive(Debug)]
struct HistoryState<T> {
    /// Ring buffer of change sets
    slots: Vec<Option<ChangeSet<T>>>,

    /// Version of the most recent change set (0 = nothing appended yet)
    current_version: u64,
}

/// Bounded, thread-safe, versioned log of change sets.
///
/// Versions are 1-based and strictly increasing. A consumer keeps a
/// watermark (the first version it has not seen yet, starting at 1) and
/// hands it to [`TransactionHistory::query`], which advances it.
///
/// # Concurrency
///
/// `append` takes the write lock; `query` only reads shared state (the
/// watermark belongs to the caller) and takes the read lock, so consumers
/// never block each other.
#[derive(Debug)]
pub struct TransactionHistory<T> {
    capacity: usize,
    state: RwLock<HistoryState<T>>,
}

impl<T> TransactionHistory<T>
where
    T: Eq + Hash + Clone,
{
    /// Creates an empty history keeping at most `capacity` change sets.
    ///
    /// A capacity of 0 is coerced to 1.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);

        Self {
            capacity,
            state: RwLock::new(HistoryState {
                slots,
                current_version: 0,
            }),
        }
    }

    /// Maximum number of retained change sets.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Version of the most recent change set (0 if none).
    pub fn current_version(&self) -> u64 {
        self.read().current_version
    }

    /// Oldest version still retained, or `None` if nothing was appended.
    pub fn oldest_retained_version(&self) -> Option<u64> {
        let state = self.read();
        oldest_retained(state.current_version, self.capacity)
    }

    /// Number of retained change sets: `min(appended, capacity)`.
    pub fn len(&self) -> usize {
        let current = self.read().current_version;
        current.min(self.capacity as u64) as usize
    }

    /// Returns true if nothing was appended yet.
    pub fn is_empty(&self) -> bool {
        self.current_version() == 0
    }

    /// Appends a change set and returns the version assigned to it.
    ///
    /// When the log is full the oldest change set is evicted.
    pub fn append(&self, change_set: ChangeSet<T>) -> u64 {
        let mut state = self.write();
        let version = state.current_version + 1;
        let slot = self.slot_index(version);
        state.slots[slot] = Some(change_set);
        state.current_version = version;
        version
    }

    /// Returns everything changed from `*version` (inclusive) to the
    /// current version.
    ///
    /// * `*version > current` - a future version: `None`, watermark untouched.
    /// * `*version` retained - the union of all retained change sets from
    ///   `*version` through the current one; watermark set to `current + 1`.
    /// * `*version` evicted - `None` and the watermark is still set to
    ///   `current + 1`. The caller missed history and must resynchronize
    ///   by other means (e.g. rescan the whole grid).
    ///
    /// Versions start at 1; a watermark of 0 reads as 1.
    pub fn query(&self, version: &mut u64) -> Option<ChangeSet<T>> {
        let state = self.read();
        let current = state.current_version;

        if *version > current {
            return None;
        }

        let from = (*version).max(1);
        let retained = oldest_retained(current, self.capacity)
            .filter(|oldest| from >= *oldest);
        let result = retained.map(|_| {
            let mut union = ChangeSet::new();
            for v in from..=current {
                if let Some(set) = &state.slots[self.slot_index(v)] {
                    union.extend(set.iter().cloned());
                }
            }
            union
        });

        *version = current + 1;
        result
    }

    fn slot_index(&self, version: u64) -> usize {
        ((version - 1) % self.capacity as u64) as usize
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, HistoryState<T>> {
        // A poisoned lock only means a writer panicked between two plain
        // assignments; the state is still consistent.
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, HistoryState<T>> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn oldest_retained(current: u64, capacity: usize) -> Option<u64> {
    if current == 0 {
        None
    } else {
        Some(current.saturating_sub(capacity as u64 - 1).max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn set(items: &[char]) -> ChangeSet<char> {
        items.iter().copied().collect()
    }

    #[test]
    fn test_capacity_coerced_to_one() {
        let history: TransactionHistory<u32> = TransactionHistory::new(0);
        assert_eq!(history.capacity(), 1);

        history.append(HashSet::from([1]));
        history.append(HashSet::from([2]));
        assert_eq!(history.len(), 1);
        assert_eq!(history.oldest_retained_version(), Some(2));
    }

    #[test]
    fn test_union_of_retained_window() {
        let history = TransactionHistory::new(3);
        for item in ['A', 'B', 'C', 'D'] {
            history.append(set(&[item]));
        }

        // Version 1 was evicted, 2..=4 are retained
        assert_eq!(history.oldest_retained_version(), Some(2));

        let mut watermark = 2;
        let changes = history.query(&mut watermark);
        assert_eq!(changes, Some(set(&['B', 'C', 'D'])));
        assert_eq!(watermark, 5);
    }

    #[test]
    fn test_future_version_has_no_side_effect() {
        let history = TransactionHistory::new(3);
        history.append(set(&['A']));

        let mut watermark = 2;
        assert_eq!(history.query(&mut watermark), None);
        assert_eq!(watermark, 2);

        // Once something new arrives, the same watermark picks it up
        history.append(set(&['B']));
        assert_eq!(history.query(&mut watermark), Some(set(&['B'])));
        assert_eq!(watermark, 3);
    }

    #[test]
    fn test_evicted_version_advances_watermark() {
        let history = TransactionHistory::new(2);
        for item in ['A', 'B', 'C', 'D'] {
            history.append(set(&[item]));
        }

        let mut watermark = 1;
        assert_eq!(history.query(&mut watermark), None);
        assert_eq!(watermark, 5);
    }

    #[test]
    fn test_empty_history_query() {
        let history: TransactionHistory<char> = TransactionHistory::new(4);
        let mut watermark = 1;
        assert_eq!(history.query(&mut watermark), None);
        assert_eq!(watermark, 1);
        assert!(history.is_empty());
        assert_eq!(history.oldest_retained_version(), None);
    }

    #[test]
    fn test_zero_watermark_reads_from_first_version() {
        let history = TransactionHistory::new(8);
        history.append(set(&['A']));
        history.append(set(&['B']));

        let mut watermark = 0;
        assert_eq!(history.query(&mut watermark), Some(set(&['A', 'B'])));
        assert_eq!(watermark, 3);
    }

    #[test]
    fn test_union_deduplicates() {
        let history = TransactionHistory::new(4);
        history.append(set(&['A', 'B']));
        history.append(set(&['B', 'C']));

        let mut watermark = 1;
        let changes = history.query(&mut watermark).unwrap();
        assert_eq!(changes.len(), 3);
    }

    #[test]
    fn test_concurrent_append_and_query() {
        let history = Arc::new(TransactionHistory::new(8));
        let writer = {
            let history = Arc::clone(&history);
            std::thread::spawn(move || {
                for i in 0..200u32 {
                    history.append(HashSet::from([i]));
                }
            })
        };

        let mut watermark = 1;
        let mut last_seen = 0;
        while last_seen < 200 {
            history.query(&mut watermark);
            last_seen = watermark - 1;
            std::thread::yield_now();
        }
        writer.join().unwrap();
        assert_eq!(history.current_version(), 200);
        assert_eq!(history.len(), 8);
    }

    proptest! {
        #[test]
        fn prop_capacity_bound(capacity in 1usize..16, appends in 0usize..64) {
            let history = TransactionHistory::new(capacity);
            for i in 0..appends {
                history.append(HashSet::from([i]));
            }
            prop_assert_eq!(history.len(), appends.min(capacity));
            prop_assert_eq!(history.current_version(), appends as u64);
        }

        #[test]
        fn prop_watermark_is_monotonic(
            capacity in 1usize..8,
            batches in proptest::collection::vec(0usize..4, 1..40),
        ) {
            // Each batch appends a few versions, then the consumer polls.
            // Items are their own version number.
            let history = TransactionHistory::new(capacity);
            let mut watermark = 1u64;
            for batch in batches {
                for _ in 0..batch {
                    let next = history.current_version() + 1;
                    history.append(HashSet::from([next]));
                }
                let before = watermark;
                if let Some(changes) = history.query(&mut watermark) {
                    prop_assert!(changes.iter().all(|v| *v >= before));
                    let expected: HashSet<u64> = (before..=history.current_version()).collect();
                    prop_assert_eq!(changes, expected);
                }
                prop_assert!(watermark >= before);
                prop_assert_eq!(watermark, history.current_version() + 1);
            }
        }
    }
}
