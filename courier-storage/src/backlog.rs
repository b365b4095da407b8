//! Per-topic ordered backlog of undelivered entries.
//!
//! Entries are kept sorted by [`EntryOrder`]: highest priority first, oldest
//! first within a priority. The order depends only on the entries, never on
//! the order they were inserted in.

use crate::{
    error::{StorageError, StorageResult},
    types::StorageId,
};
use courier_core::{EntryId, EntryOrder, QueueEntry};
use parking_lot::RwLock;
use std::{
    collections::{BTreeMap, HashMap},
    fmt,
    sync::Arc,
};
use tracing::trace;

/// Where an entry sits and the size it was charged with on insert.
#[derive(Debug, Clone, Copy)]
struct Slot {
    key: EntryOrder,
    charged_bytes: u64,
}

struct BacklogState<E> {
    entries: BTreeMap<EntryOrder, Arc<E>>,
    by_id: HashMap<EntryId, Slot>,
    num_bytes: u64,
}

impl<E: QueueEntry> BacklogState<E> {
    fn take(&mut self, id: EntryId) -> Option<Arc<E>> {
        let slot = self.by_id.remove(&id)?;
        let entry = self.entries.remove(&slot.key)?;
        // an entry may have been resized since it was queued
        self.num_bytes -= slot.charged_bytes;
        Some(entry)
    }
}

/// Bounded, priority ordered entry sequence of one topic
pub struct Backlog<E: QueueEntry> {
    id: StorageId,
    max_entries: u64,
    state: RwLock<BacklogState<E>>,
}

impl<E: QueueEntry> Backlog<E> {
    /// Create a backlog holding at most `max_entries` entries
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if `max_entries` is zero
    pub fn new(id: impl Into<StorageId>, max_entries: u64) -> StorageResult<Self> {
        if max_entries == 0 {
            return Err(StorageError::ConfigurationError {
                parameter: "max_entries".to_string(),
                value: max_entries.to_string(),
                reason: "must be greater than 0".to_string(),
            });
        }
        Ok(Self {
            id: id.into(),
            max_entries,
            state: RwLock::new(BacklogState {
                entries: BTreeMap::new(),
                by_id: HashMap::new(),
                num_bytes: 0,
            }),
        })
    }

    /// Backlog name
    #[must_use]
    pub fn id(&self) -> &StorageId {
        &self.id
    }

    /// Insert an entry. Returns 0 if an entry with this id is already queued.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ResourceExhausted` if the backlog is full
    pub fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        let mut state = self.state.write();
        let id = entry.unique_id();
        if state.by_id.contains_key(&id) {
            return Ok(0);
        }

        let queued = state.entries.len() as u64;
        if queued >= self.max_entries {
            return Err(StorageError::exhausted(
                self.id.as_str(),
                "entries",
                queued,
                self.max_entries,
            ));
        }

        let key = entry.sort_key();
        let charged_bytes = entry.size_in_bytes();
        trace!(backlog = %self.id, entry = %entry.log_id(), "Queued entry");
        state.num_bytes += charged_bytes;
        state.by_id.insert(id, Slot { key, charged_bytes });
        state.entries.insert(key, entry);
        Ok(1)
    }

    /// The entry that should be served next.
    #[must_use]
    pub fn peek_first(&self) -> Option<Arc<E>> {
        self.state.read().entries.values().next().cloned()
    }

    /// Up to `count` entries in serving order.
    #[must_use]
    pub fn peek(&self, count: usize) -> Vec<Arc<E>> {
        self.state.read().entries.values().take(count).cloned().collect()
    }

    /// Up to `count` entries sharing the priority of the first entry.
    #[must_use]
    pub fn peek_same_priority(&self, count: usize) -> Vec<Arc<E>> {
        let state = self.state.read();
        let Some(first) = state.entries.keys().next().map(|key| key.priority) else {
            return Vec::new();
        };
        state
            .entries
            .iter()
            .take_while(|(key, _)| key.priority == first)
            .take(count)
            .map(|(_, entry)| Arc::clone(entry))
            .collect()
    }

    /// Remove an entry wherever it sits in the order. Returns the number of
    /// entries removed.
    pub fn remove(&self, entry: &E) -> usize {
        self.remove_id(entry.unique_id())
    }

    /// Remove by id. Returns the number of entries removed.
    pub fn remove_id(&self, id: EntryId) -> usize {
        self.state.write().take(id).map_or(0, |_| 1)
    }

    /// Remove and return the entry that should be served next.
    pub fn take_first(&self) -> Option<Arc<E>> {
        let mut state = self.state.write();
        let id = state.entries.keys().next()?.id;
        state.take(id)
    }

    /// Whether an entry with this id is queued.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.state.read().by_id.contains_key(&id)
    }

    /// Number of queued entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    /// Whether nothing is queued
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }

    /// Sum of the sizes of the queued entries
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.state.read().num_bytes
    }

    /// Entry limit
    #[must_use]
    pub fn max_entries(&self) -> u64 {
        self.max_entries
    }

    /// Drop everything. Returns how many entries were queued.
    pub fn clear(&self) -> usize {
        let mut state = self.state.write();
        let count = state.entries.len();
        state.entries.clear();
        state.by_id.clear();
        state.num_bytes = 0;
        count
    }

    /// All queued entries in serving order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Arc<E>> {
        self.state.read().entries.values().cloned().collect()
    }
}

impl<E: QueueEntry> fmt::Debug for Backlog<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backlog")
            .field("id", &self.id)
            .field("len", &self.len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_core::{MessageEntry, Priority};
    use proptest::prelude::*;

    fn entry(priority: u8, id: u64) -> Arc<MessageEntry> {
        Arc::new(
            MessageEntry::builder("backlog.test")
                .with_id(EntryId::from_raw(id))
                .with_priority(Priority::new(priority).unwrap())
                .with_size_in_bytes(10)
                .build()
                .unwrap(),
        )
    }

    fn ids(entries: &[Arc<MessageEntry>]) -> Vec<u64> {
        entries.iter().map(|e| e.unique_id().as_u64()).collect()
    }

    #[test]
    fn test_serving_order() {
        let backlog = Backlog::new("b", 100).unwrap();
        for (priority, id) in [(0, 5), (5, 4), (9, 3), (5, 2), (9, 1)] {
            backlog.put(entry(priority, id)).unwrap();
        }
        assert_eq!(ids(&backlog.snapshot()), vec![1, 3, 2, 4, 5]);
        assert_eq!(backlog.peek_first().unwrap().unique_id().as_u64(), 1);
        assert_eq!(ids(&backlog.peek(2)), vec![1, 3]);
        assert_eq!(ids(&backlog.peek_same_priority(10)), vec![1, 3]);
        assert_eq!(ids(&backlog.peek_same_priority(1)), vec![1]);
    }

    #[test]
    fn test_put_is_idempotent_by_id() {
        let backlog = Backlog::new("b", 100).unwrap();
        assert_eq!(backlog.put(entry(5, 1)).unwrap(), 1);
        assert_eq!(backlog.put(entry(5, 1)).unwrap(), 0);
        assert_eq!(backlog.put(entry(9, 1)).unwrap(), 0);
        assert_eq!(backlog.len(), 1);
        assert_eq!(backlog.num_bytes(), 10);
    }

    #[test]
    fn test_capacity() {
        let backlog = Backlog::new("b", 2).unwrap();
        backlog.put(entry(5, 1)).unwrap();
        backlog.put(entry(5, 2)).unwrap();
        let err = backlog.put(entry(9, 3)).unwrap_err();
        assert!(matches!(err, StorageError::ResourceExhausted { .. }));
        assert!(Backlog::<MessageEntry>::new("b", 0).is_err());
    }

    #[test]
    fn test_random_removal_and_take() {
        let backlog = Backlog::new("b", 100).unwrap();
        let middle = entry(5, 2);
        backlog.put(entry(9, 1)).unwrap();
        backlog.put(Arc::clone(&middle)).unwrap();
        backlog.put(entry(0, 3)).unwrap();

        assert_eq!(backlog.remove(&middle), 1);
        assert_eq!(backlog.remove(&middle), 0);
        assert!(!backlog.contains(middle.unique_id()));
        assert_eq!(backlog.take_first().unwrap().unique_id().as_u64(), 1);
        assert_eq!(backlog.take_first().unwrap().unique_id().as_u64(), 3);
        assert!(backlog.take_first().is_none());
        assert!(backlog.is_empty());
        assert_eq!(backlog.num_bytes(), 0);
    }

    #[test]
    fn test_resized_entry_releases_charged_bytes() {
        let backlog = Backlog::new("b", 100).unwrap();
        let resized = entry(5, 1);
        backlog.put(Arc::clone(&resized)).unwrap();
        backlog.put(entry(5, 2)).unwrap();
        assert_eq!(backlog.num_bytes(), 20);

        resized.set_size_in_bytes(4);
        assert_eq!(backlog.remove(&resized), 1);
        assert_eq!(backlog.num_bytes(), 10);

        resized.set_size_in_bytes(40);
        backlog.put(Arc::clone(&resized)).unwrap();
        assert_eq!(backlog.num_bytes(), 50);
        assert_eq!(backlog.take_first().unwrap().unique_id().as_u64(), 1);
        assert_eq!(backlog.num_bytes(), 10);
    }

    #[test]
    fn test_clear() {
        let backlog = Backlog::new("b", 100).unwrap();
        backlog.put(entry(1, 1)).unwrap();
        backlog.put(entry(2, 2)).unwrap();
        assert_eq!(backlog.clear(), 2);
        assert!(backlog.is_empty());
        assert!(backlog.peek_same_priority(3).is_empty());
        assert_eq!(backlog.put(entry(1, 1)).unwrap(), 1);
    }

    proptest! {
        #[test]
        fn prop_drain_order_ignores_insertion_order(order in Just((0u64..5).collect::<Vec<_>>()).prop_shuffle()) {
            let priorities = [9u8, 9, 5, 5, 0];
            let backlog = Backlog::new("b", 100).unwrap();
            for index in order {
                let slot = index as usize;
                backlog.put(entry(priorities[slot], index + 1)).unwrap();
            }

            let mut drained = Vec::new();
            while let Some(next) = backlog.take_first() {
                drained.push((next.priority().value(), next.unique_id().as_u64()));
            }
            prop_assert_eq!(drained, vec![(9, 1), (9, 2), (5, 3), (5, 4), (0, 5)]);
        }
    }
}
