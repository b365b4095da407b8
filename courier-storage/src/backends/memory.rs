//! Bounded in-memory store with least-recently-touched eviction
//!
//! Holds entries keyed by id up to an entry and a byte limit. Every insert
//! and every read stamps the entry with a fresh [`UniqueTimestamp`]; the
//! ordered `(stamp, id)` index then yields the eviction candidate in
//! `O(log n)`.
//!
//! Admission is burst tolerant on bytes: the insert that crosses
//! `max_bytes` is still accepted and only the following one is refused.
//! The entry limit is exact.

use crate::{
    error::{StorageError, StorageResult},
    listener::SizeListeners,
    traits::{EntryStore, SpillStore, StorageSize, StorageSizeListener},
    types::StorageId,
};
use courier_core::{config::StoreSettings, EntryId, QueueEntry, UniqueTimestamp};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::{BTreeSet, HashMap},
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, error, info, trace};

/// Bounded store configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreConfig {
    /// Maximum number of entries
    pub max_entries: u64,
    /// Maximum number of bytes
    pub max_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        let settings = StoreSettings::default();
        Self { max_entries: settings.max_entries, max_bytes: settings.max_bytes }
    }
}

impl StoreConfig {
    /// Create a configuration with default limits
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the entry limit
    #[must_use]
    pub fn with_max_entries(mut self, max_entries: u64) -> Self {
        self.max_entries = max_entries;
        self
    }

    /// Set the byte limit
    #[must_use]
    pub fn with_max_bytes(mut self, max_bytes: u64) -> Self {
        self.max_bytes = max_bytes;
        self
    }

    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if a limit is zero
    pub fn validate(&self) -> StorageResult<()> {
        check_limit("max_entries", self.max_entries)?;
        check_limit("max_bytes", self.max_bytes)
    }
}

impl From<&StoreSettings> for StoreConfig {
    fn from(settings: &StoreSettings) -> Self {
        Self { max_entries: settings.max_entries, max_bytes: settings.max_bytes }
    }
}

fn check_limit(parameter: &str, value: u64) -> StorageResult<()> {
    if value == 0 {
        return Err(StorageError::ConfigurationError {
            parameter: parameter.to_string(),
            value: value.to_string(),
            reason: "must be greater than 0".to_string(),
        });
    }
    Ok(())
}

/// Operation counters of a store
#[derive(Debug, Default)]
pub struct StoreMetrics {
    /// Entries inserted
    pub inserts: AtomicU64,
    /// Puts of an id that was already held
    pub duplicate_puts: AtomicU64,
    /// Puts refused for capacity
    pub overflows: AtomicU64,
    /// Entries removed by `remove_oldest`
    pub evictions: AtomicU64,
    /// Times the LRU index was found out of sync with the entry map
    pub index_repairs: AtomicU64,
}

impl StoreMetrics {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of the counters
    #[must_use]
    pub fn snapshot(&self) -> StoreMetricsSnapshot {
        StoreMetricsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            duplicate_puts: self.duplicate_puts.load(Ordering::Relaxed),
            overflows: self.overflows.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            index_repairs: self.index_repairs.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`StoreMetrics`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreMetricsSnapshot {
    /// Entries inserted
    pub inserts: u64,
    /// Puts of an id that was already held
    pub duplicate_puts: u64,
    /// Puts refused for capacity
    pub overflows: u64,
    /// Entries removed by `remove_oldest`
    pub evictions: u64,
    /// Times the LRU index was found out of sync with the entry map
    pub index_repairs: u64,
}

struct StoredRecord<E> {
    entry: Arc<E>,
    last_touched: AtomicU64,
    /// Size the counters were charged with.
    accounted_bytes: u64,
}

struct StoreState<E> {
    records: HashMap<EntryId, StoredRecord<E>>,
    /// `(last_touched, id)`; readers touch under the read lock, hence the mutex.
    lru: Mutex<BTreeSet<(u64, EntryId)>>,
    num_bytes: u64,
    num_persistent_entries: u64,
    num_persistent_bytes: u64,
    shutdown: bool,
}

impl<E: QueueEntry> StoreState<E> {
    fn new() -> Self {
        Self {
            records: HashMap::new(),
            lru: Mutex::new(BTreeSet::new()),
            num_bytes: 0,
            num_persistent_entries: 0,
            num_persistent_bytes: 0,
            shutdown: false,
        }
    }

    fn insert(&mut self, entry: Arc<E>) {
        let id = entry.unique_id();
        let size = entry.size_in_bytes();
        let stamp = UniqueTimestamp::next();

        self.lru.get_mut().insert((stamp, id));
        self.num_bytes += size;
        if entry.is_persistent() {
            self.num_persistent_entries += 1;
            self.num_persistent_bytes += size;
        }
        entry.set_stored(true);
        self.records.insert(
            id,
            StoredRecord { entry, last_touched: AtomicU64::new(stamp), accounted_bytes: size },
        );
    }

    fn take(&mut self, id: EntryId) -> Option<Arc<E>> {
        let record = self.records.remove(&id)?;
        let stamp = record.last_touched.load(Ordering::Acquire);
        self.lru.get_mut().remove(&(stamp, id));

        self.num_bytes = self.num_bytes.saturating_sub(record.accounted_bytes);
        if record.entry.is_persistent() {
            self.num_persistent_entries = self.num_persistent_entries.saturating_sub(1);
            self.num_persistent_bytes =
                self.num_persistent_bytes.saturating_sub(record.accounted_bytes);
        }
        record.entry.set_stored(false);
        Some(record.entry)
    }

    fn take_any(&mut self) -> Option<Arc<E>> {
        let id = self.records.keys().next().copied()?;
        self.take(id)
    }

    /// Refresh the stamp of a held entry. Only needs `&self`.
    fn touch(&self, id: EntryId) -> Option<Arc<E>> {
        let record = self.records.get(&id)?;
        let mut lru = self.lru.lock();
        let stamp = UniqueTimestamp::next();
        let previous = record.last_touched.swap(stamp, Ordering::AcqRel);
        lru.remove(&(previous, id));
        lru.insert((stamp, id));
        Some(Arc::clone(&record.entry))
    }

    fn recount(&mut self, id: EntryId) {
        let Some(record) = self.records.get_mut(&id) else { return };
        let size = record.entry.size_in_bytes();
        let previous = record.accounted_bytes;
        record.accounted_bytes = size;

        self.num_bytes = self.num_bytes.saturating_sub(previous) + size;
        if record.entry.is_persistent() {
            self.num_persistent_bytes = self.num_persistent_bytes.saturating_sub(previous) + size;
        }
    }

    fn clear(&mut self) -> usize {
        let count = self.records.len();
        for record in self.records.values() {
            record.entry.set_stored(false);
        }
        self.records.clear();
        self.lru.get_mut().clear();
        self.num_bytes = 0;
        self.num_persistent_entries = 0;
        self.num_persistent_bytes = 0;
        count
    }
}

/// Bounded in-memory entry store
///
/// Mutations take the write lock; `get`, `get_all` and the counters take
/// the read lock and run concurrently with each other. Size listeners are
/// called after the lock is released.
pub struct BoundedStore<E: QueueEntry> {
    id: StorageId,
    max_entries: AtomicU64,
    max_bytes: AtomicU64,
    state: RwLock<StoreState<E>>,
    listeners: SizeListeners,
    metrics: StoreMetrics,
}

impl<E: QueueEntry> BoundedStore<E> {
    /// Create a store
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if a limit is zero
    pub fn new(id: impl Into<StorageId>, config: StoreConfig) -> StorageResult<Self> {
        config.validate()?;
        let id = id.into();
        info!(
            storage = %id,
            max_entries = config.max_entries,
            max_bytes = config.max_bytes,
            "Created bounded store"
        );
        Ok(Self {
            id,
            max_entries: AtomicU64::new(config.max_entries),
            max_bytes: AtomicU64::new(config.max_bytes),
            state: RwLock::new(StoreState::new()),
            listeners: SizeListeners::new(),
            metrics: StoreMetrics::default(),
        })
    }

    /// Store name
    #[must_use]
    pub fn id(&self) -> &StorageId {
        &self.id
    }

    /// Insert an entry.
    ///
    /// Returns 1 if the entry was inserted, 0 if an entry with the same id
    /// was already held (that entry is kept and its touch stamp refreshed).
    ///
    /// # Errors
    ///
    /// - `StorageError::ResourceExhausted` if a limit is reached
    /// - `StorageError::InvalidArgument` after [`shutdown`](Self::shutdown)
    pub fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        let added = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            self.check_open(state)?;

            let id = entry.unique_id();
            if state.touch(id).is_some() {
                trace!(storage = %self.id, entry = %id, "Entry already stored, refreshed touch");
                StoreMetrics::incr(&self.metrics.duplicate_puts);
                0
            } else {
                self.check_capacity(state)?;
                trace!(storage = %self.id, entry = %entry.log_id(), "Storing entry");
                state.insert(entry);
                StoreMetrics::incr(&self.metrics.inserts);
                1
            }
        };
        self.listeners.notify(self);
        Ok(added)
    }

    /// Look an entry up and refresh its touch stamp.
    pub fn get(&self, id: EntryId) -> Option<Arc<E>> {
        self.state.read().touch(id)
    }

    /// Whether an entry with this id is held. Does not touch.
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.state.read().records.contains_key(&id)
    }

    /// Touch stamp of a held entry.
    #[must_use]
    pub fn last_touched(&self, id: EntryId) -> Option<u64> {
        self.state.read().records.get(&id).map(|r| r.last_touched.load(Ordering::Acquire))
    }

    /// All entries in id order. Does not touch.
    #[must_use]
    pub fn get_all(&self) -> Vec<Arc<E>> {
        self.get_all_filtered(|entry| Some(Arc::clone(entry)))
    }

    /// All entries in id order, passed through `mapper`; `None` drops an
    /// entry from the result. The mapper runs after the lock is released.
    pub fn get_all_filtered<F>(&self, mut mapper: F) -> Vec<Arc<E>>
    where
        F: FnMut(&Arc<E>) -> Option<Arc<E>>,
    {
        let mut snapshot: Vec<Arc<E>> =
            self.state.read().records.values().map(|r| Arc::clone(&r.entry)).collect();
        snapshot.sort_by_key(|entry| entry.unique_id());
        snapshot.iter().filter_map(|entry| mapper(entry)).collect()
    }

    /// Remove an entry by id. Returns the number of entries removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` after shutdown
    pub fn remove(&self, id: EntryId) -> StorageResult<usize> {
        let removed = {
            let mut guard = self.state.write();
            self.check_open(&guard)?;
            guard.take(id).map_or(0, |_| 1)
        };
        self.listeners.notify(self);
        Ok(removed)
    }

    /// Remove the entry with the same id as `entry`.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` after shutdown
    pub fn remove_entry(&self, entry: &E) -> StorageResult<usize> {
        self.remove(entry.unique_id())
    }

    /// Remove and return the least recently touched entry.
    ///
    /// If the LRU index disagrees with the entry map the store repairs
    /// itself by evicting an arbitrary entry and logs the anomaly.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` after shutdown
    pub fn remove_oldest(&self) -> StorageResult<Option<Arc<E>>> {
        let evicted = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            self.check_open(state)?;

            match state.lru.get_mut().pop_first() {
                Some((stamp, id)) => match state.take(id) {
                    Some(entry) => Some(entry),
                    None => {
                        error!(
                            storage = %self.id,
                            entry = %id,
                            stamp,
                            held = state.records.len(),
                            "LRU index references an entry that is not stored, evicting an arbitrary entry"
                        );
                        StoreMetrics::incr(&self.metrics.index_repairs);
                        state.take_any()
                    },
                },
                None if !state.records.is_empty() => {
                    error!(
                        storage = %self.id,
                        held = state.records.len(),
                        "LRU index is empty but entries are stored, evicting an arbitrary entry"
                    );
                    StoreMetrics::incr(&self.metrics.index_repairs);
                    state.take_any()
                },
                None => None,
            }
        };
        if let Some(entry) = &evicted {
            StoreMetrics::incr(&self.metrics.evictions);
            debug!(storage = %self.id, entry = %entry.log_id(), "Removed least recently touched entry");
        }
        self.listeners.notify(self);
        Ok(evicted)
    }

    /// Remove every non-persistent entry. Returns how many were removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` after shutdown
    pub fn remove_transient(&self) -> StorageResult<usize> {
        let removed = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            self.check_open(state)?;
            let transient: Vec<EntryId> = state
                .records
                .iter()
                .filter(|(_, record)| !record.entry.is_persistent())
                .map(|(id, _)| *id)
                .collect();
            transient.into_iter().filter_map(|id| state.take(id)).count()
        };
        self.listeners.notify(self);
        Ok(removed)
    }

    /// Empty the store and reset every counter. Returns how many entries
    /// were dropped.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` after shutdown
    pub fn clear(&self) -> StorageResult<usize> {
        let cleared = {
            let mut guard = self.state.write();
            self.check_open(&guard)?;
            guard.clear()
        };
        debug!(storage = %self.id, cleared, "Cleared store");
        self.listeners.notify(self);
        Ok(cleared)
    }

    /// Apply `mutator` to a held entry.
    ///
    /// If the mutator returns the same `Arc` the entry was changed in place
    /// and only the counters are recomputed. A different `Arc` replaces the
    /// entry. The mutator runs under the store lock and must not call back
    /// into the store.
    ///
    /// # Errors
    ///
    /// - `StorageError::Internal` if the entry is not held or the
    ///   replacement changes the persistent flag
    /// - `StorageError::InvalidArgument` if the replacement carries the id
    ///   of another held entry, or after shutdown
    pub fn change<F>(&self, id: EntryId, mutator: F) -> StorageResult<Arc<E>>
    where
        F: FnOnce(&Arc<E>) -> Arc<E>,
    {
        let changed = {
            let mut guard = self.state.write();
            let state = &mut *guard;
            self.check_open(state)?;

            let old = state.records.get(&id).map(|r| Arc::clone(&r.entry)).ok_or_else(|| {
                StorageError::internal(self.id.as_str(), format!("entry {id} to change is not stored"))
            })?;
            let new = mutator(&old);

            if new.is_persistent() != old.is_persistent() {
                error!(storage = %self.id, entry = %id, "Change attempted to flip the persistent flag");
                return Err(StorageError::internal(
                    self.id.as_str(),
                    format!("changing entry {id} must not alter its persistent flag"),
                ));
            }

            if Arc::ptr_eq(&old, &new) {
                state.recount(id);
            } else {
                let new_id = new.unique_id();
                if new_id != id && state.records.contains_key(&new_id) {
                    return Err(StorageError::invalid_argument(
                        self.id.as_str(),
                        format!("replacement {new_id} for {id} is already stored"),
                    ));
                }
                if state.take(id).is_none() {
                    return Err(StorageError::internal(
                        self.id.as_str(),
                        format!("entry {id} vanished while being changed"),
                    ));
                }
                state.insert(Arc::clone(&new));
            }
            new
        };
        self.listeners.notify(self);
        Ok(changed)
    }

    /// [`change`](Self::change) keyed by an entry.
    ///
    /// # Errors
    ///
    /// See [`change`](Self::change).
    pub fn change_entry<F>(&self, entry: &E, mutator: F) -> StorageResult<Arc<E>>
    where
        F: FnOnce(&Arc<E>) -> Arc<E>,
    {
        self.change(entry.unique_id(), mutator)
    }

    /// Re-read the size of an entry that was resized in place.
    ///
    /// # Errors
    ///
    /// See [`change`](Self::change).
    pub fn update_counters(&self, id: EntryId) -> StorageResult<()> {
        self.change(id, Arc::clone).map(|_| ())
    }

    /// Entries currently held
    #[must_use]
    pub fn num_entries(&self) -> u64 {
        self.state.read().records.len() as u64
    }

    /// Bytes currently held
    #[must_use]
    pub fn num_bytes(&self) -> u64 {
        self.state.read().num_bytes
    }

    /// Persistent entries currently held
    #[must_use]
    pub fn num_persistent_entries(&self) -> u64 {
        self.state.read().num_persistent_entries
    }

    /// Bytes of the persistent entries currently held
    #[must_use]
    pub fn num_persistent_bytes(&self) -> u64 {
        self.state.read().num_persistent_bytes
    }

    /// Entry limit
    #[must_use]
    pub fn max_entries(&self) -> u64 {
        self.max_entries.load(Ordering::Acquire)
    }

    /// Byte limit
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.max_bytes.load(Ordering::Acquire)
    }

    /// Change the entry limit. Entries already held are kept.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if `max_entries` is zero
    pub fn set_max_entries(&self, max_entries: u64) -> StorageResult<()> {
        check_limit("max_entries", max_entries)?;
        self.max_entries.store(max_entries, Ordering::Release);
        debug!(storage = %self.id, max_entries, "Changed entry limit");
        Ok(())
    }

    /// Change the byte limit. Entries already held are kept.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if `max_bytes` is zero
    pub fn set_max_bytes(&self, max_bytes: u64) -> StorageResult<()> {
        check_limit("max_bytes", max_bytes)?;
        self.max_bytes.store(max_bytes, Ordering::Release);
        debug!(storage = %self.id, max_bytes, "Changed byte limit");
        Ok(())
    }

    /// Register a size listener. Returns `false` if already registered.
    pub fn add_size_listener(&self, listener: Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unregister a size listener. Returns `false` if it was unknown.
    pub fn remove_size_listener(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Whether the listener is registered
    #[must_use]
    pub fn has_size_listener(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.contains(listener)
    }

    /// Operation counters
    #[must_use]
    pub fn metrics(&self) -> StoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Stop accepting mutations.
    ///
    /// Held entries stay readable. Listeners are notified one last time and
    /// then dropped.
    pub fn shutdown(&self) {
        let held = {
            let mut guard = self.state.write();
            if guard.shutdown {
                return;
            }
            guard.shutdown = true;
            guard.lru.get_mut().clear();
            guard.records.len()
        };
        info!(storage = %self.id, held, "Store shut down");
        self.listeners.notify(self);
        self.listeners.clear();
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.read().shutdown
    }

    fn check_open(&self, state: &StoreState<E>) -> StorageResult<()> {
        if state.shutdown {
            return Err(StorageError::invalid_argument(self.id.as_str(), "store is shut down"));
        }
        Ok(())
    }

    fn check_capacity(&self, state: &StoreState<E>) -> StorageResult<()> {
        let entries = state.records.len() as u64;
        let max_entries = self.max_entries();
        if entries >= max_entries {
            StoreMetrics::incr(&self.metrics.overflows);
            debug!(storage = %self.id, entries, max_entries, "Entry limit reached");
            return Err(StorageError::exhausted(self.id.as_str(), "entries", entries, max_entries));
        }

        let max_bytes = self.max_bytes();
        if state.num_bytes > max_bytes {
            StoreMetrics::incr(&self.metrics.overflows);
            debug!(storage = %self.id, bytes = state.num_bytes, max_bytes, "Byte limit reached");
            return Err(StorageError::exhausted(
                self.id.as_str(),
                "bytes",
                state.num_bytes,
                max_bytes,
            ));
        }
        Ok(())
    }
}

impl<E: QueueEntry> StorageSize for BoundedStore<E> {
    fn storage_id(&self) -> &str {
        self.id.as_str()
    }

    fn num_entries(&self) -> u64 {
        BoundedStore::num_entries(self)
    }

    fn num_bytes(&self) -> u64 {
        BoundedStore::num_bytes(self)
    }

    fn num_persistent_entries(&self) -> u64 {
        BoundedStore::num_persistent_entries(self)
    }

    fn num_persistent_bytes(&self) -> u64 {
        BoundedStore::num_persistent_bytes(self)
    }

    fn max_entries(&self) -> u64 {
        BoundedStore::max_entries(self)
    }

    fn max_bytes(&self) -> u64 {
        BoundedStore::max_bytes(self)
    }
}

impl<E: QueueEntry> EntryStore<E> for BoundedStore<E> {
    fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        BoundedStore::put(self, entry)
    }

    fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>> {
        Ok(BoundedStore::get(self, id))
    }

    fn contains(&self, id: EntryId) -> bool {
        BoundedStore::contains(self, id)
    }

    fn remove(&self, id: EntryId) -> StorageResult<usize> {
        BoundedStore::remove(self, id)
    }

    fn shutdown(&self) {
        BoundedStore::shutdown(self);
    }
}

/// A RAM store can stand in for a persistence backend, e.g. as a second
/// tier or in tests.
impl<E: QueueEntry> SpillStore<E> for BoundedStore<E> {
    fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        BoundedStore::put(self, entry)
    }

    fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>> {
        Ok(BoundedStore::get(self, id))
    }

    fn remove(&self, id: EntryId) -> StorageResult<usize> {
        BoundedStore::remove(self, id)
    }

    fn num_entries(&self) -> u64 {
        BoundedStore::num_entries(self)
    }

    fn num_bytes(&self) -> u64 {
        BoundedStore::num_bytes(self)
    }

    fn max_entries(&self) -> u64 {
        BoundedStore::max_entries(self)
    }

    fn max_bytes(&self) -> u64 {
        BoundedStore::max_bytes(self)
    }

    fn is_available(&self) -> bool {
        !self.is_shutdown()
    }
}

impl<E: QueueEntry> fmt::Debug for BoundedStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.read();
        f.debug_struct("BoundedStore")
            .field("id", &self.id)
            .field("num_entries", &state.records.len())
            .field("num_bytes", &state.num_bytes)
            .field("max_entries", &self.max_entries())
            .field("max_bytes", &self.max_bytes())
            .field("shutdown", &state.shutdown)
            .finish()
    }
}
