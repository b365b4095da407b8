//! Two-tier store: a bounded RAM tier that swaps to a spill store.
//!
//! Persistent entries are written through to the spill store on insert.
//! Transient entries only reach the spill store when the RAM tier is full
//! and they are the least recently touched. A miss in RAM falls back to the
//! spill store and reloads the entry.

use crate::{
    backends::memory::{BoundedStore, StoreConfig},
    error::{StorageError, StorageResult},
    listener::SizeListeners,
    traits::{EntryStore, SpillStore, StorageSize, StorageSizeListener},
    types::StorageId,
};
use courier_core::{config::StoreSettings, EntryId, QueueEntry};
use parking_lot::Mutex;
use std::{collections::HashMap, fmt, sync::Arc};
use tracing::{debug, error, warn};

/// Limits of a [`SwappingStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwappingStoreConfig {
    /// Entries held across both tiers
    pub max_entries: u64,
    /// Bytes held across both tiers
    pub max_bytes: u64,
    /// Entries kept in RAM
    pub max_entries_cache: u64,
    /// Bytes kept in RAM
    pub max_bytes_cache: u64,
}

impl Default for SwappingStoreConfig {
    fn default() -> Self {
        Self::from(&StoreSettings::default())
    }
}

impl From<&StoreSettings> for SwappingStoreConfig {
    fn from(settings: &StoreSettings) -> Self {
        Self {
            max_entries: settings.max_entries,
            max_bytes: settings.max_bytes,
            max_entries_cache: settings.max_entries_cache,
            max_bytes_cache: settings.max_bytes_cache,
        }
    }
}

impl SwappingStoreConfig {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if a limit is zero
    pub fn validate(&self) -> StorageResult<()> {
        StoreConfig::new()
            .with_max_entries(self.max_entries)
            .with_max_bytes(self.max_bytes)
            .validate()?;
        self.ram_config().validate()
    }

    fn ram_config(&self) -> StoreConfig {
        StoreConfig::new()
            .with_max_entries(self.max_entries_cache)
            .with_max_bytes(self.max_bytes_cache)
    }
}

#[derive(Debug, Clone, Copy)]
struct Footprint {
    size: u64,
    persistent: bool,
}

#[derive(Default)]
struct CacheState {
    known: HashMap<EntryId, Footprint>,
    num_bytes: u64,
    num_persistent_entries: u64,
    num_persistent_bytes: u64,
}

impl CacheState {
    fn add(&mut self, id: EntryId, footprint: Footprint) {
        self.num_bytes += footprint.size;
        if footprint.persistent {
            self.num_persistent_entries += 1;
            self.num_persistent_bytes += footprint.size;
        }
        self.known.insert(id, footprint);
    }

    fn forget(&mut self, id: EntryId) -> Option<Footprint> {
        let footprint = self.known.remove(&id)?;
        self.num_bytes = self.num_bytes.saturating_sub(footprint.size);
        if footprint.persistent {
            self.num_persistent_entries = self.num_persistent_entries.saturating_sub(1);
            self.num_persistent_bytes = self.num_persistent_bytes.saturating_sub(footprint.size);
        }
        Some(footprint)
    }
}

/// RAM store backed by an optional spill store
pub struct SwappingStore<E: QueueEntry> {
    id: StorageId,
    config: SwappingStoreConfig,
    ram: BoundedStore<E>,
    spill: Option<Arc<dyn SpillStore<E>>>,
    state: Mutex<CacheState>,
    listeners: SizeListeners,
}

impl<E: QueueEntry> SwappingStore<E> {
    /// Create a swapping store. Without a spill store it behaves like a
    /// [`BoundedStore`] limited by the cache limits.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::ConfigurationError` if a limit is zero
    pub fn new(
        id: impl Into<StorageId>,
        config: SwappingStoreConfig,
        spill: Option<Arc<dyn SpillStore<E>>>,
    ) -> StorageResult<Self> {
        config.validate()?;
        let id = id.into();
        let ram = BoundedStore::new(format!("{id}/ram"), config.ram_config())?;
        Ok(Self {
            id,
            config,
            ram,
            spill,
            state: Mutex::new(CacheState::default()),
            listeners: SizeListeners::new(),
        })
    }

    /// Store name
    #[must_use]
    pub fn id(&self) -> &StorageId {
        &self.id
    }

    /// The RAM tier
    #[must_use]
    pub fn ram(&self) -> &BoundedStore<E> {
        &self.ram
    }

    /// Whether a spill store is attached and available
    #[must_use]
    pub fn has_spill(&self) -> bool {
        self.spill.as_ref().is_some_and(|spill| spill.is_available())
    }

    /// Insert an entry. Returns 0 if the id is already held.
    ///
    /// # Errors
    ///
    /// - `StorageError::ResourceExhausted` if the total limits are reached,
    ///   or the RAM tier is full and no spill store is attached
    /// - `StorageError::SpillUnavailable` if swapping failed; the cache is
    ///   left as it was
    pub fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        let added = {
            let mut state = self.state.lock();
            let id = entry.unique_id();
            if state.known.contains_key(&id) {
                let _ = self.ram.get(id);
                return Ok(0);
            }

            let entries = state.known.len() as u64;
            if entries >= self.config.max_entries {
                return Err(StorageError::exhausted(
                    self.id.as_str(),
                    "entries",
                    entries,
                    self.config.max_entries,
                ));
            }
            if state.num_bytes > self.config.max_bytes {
                return Err(StorageError::exhausted(
                    self.id.as_str(),
                    "bytes",
                    state.num_bytes,
                    self.config.max_bytes,
                ));
            }

            let written_through = match (&self.spill, entry.is_persistent()) {
                (Some(spill), true) => {
                    self.spill_put(spill, &entry)?;
                    true
                },
                _ => false,
            };

            let inserted = self.make_room().and_then(|()| self.ram.put(Arc::clone(&entry)));
            if let Err(err) = inserted {
                if written_through {
                    self.spill_remove(id);
                }
                return Err(err);
            }

            let footprint =
                Footprint { size: entry.size_in_bytes(), persistent: entry.is_persistent() };
            state.add(id, footprint);
            1
        };
        self.listeners.notify(self);
        Ok(added)
    }

    /// Look an entry up in RAM, then in the spill store. An entry found in
    /// the spill store is loaded back into RAM.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::SpillUnavailable` if the spill store fails
    pub fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>> {
        if let Some(entry) = self.ram.get(id) {
            return Ok(Some(entry));
        }
        let Some(spill) = &self.spill else { return Ok(None) };

        let _state = self.state.lock();
        if let Some(entry) = self.ram.get(id) {
            return Ok(Some(entry));
        }
        let fetched = spill.get(id).map_err(|err| self.unavailable(&err))?;
        let Some(entry) = fetched else { return Ok(None) };

        self.make_room()?;
        let transient = !entry.is_persistent();
        if transient {
            self.spill_remove(id);
        }
        if let Err(err) = self.ram.put(Arc::clone(&entry)) {
            if transient {
                self.spill_put(spill, &entry)?;
            }
            return Err(err);
        }
        debug!(storage = %self.id, entry = %entry.log_id(), "Reloaded entry from spill store");
        Ok(Some(entry))
    }

    /// Whether an entry is held in either tier
    #[must_use]
    pub fn contains(&self, id: EntryId) -> bool {
        self.state.lock().known.contains_key(&id)
    }

    /// Remove an entry from both tiers. Returns the number removed.
    ///
    /// # Errors
    ///
    /// Returns `StorageError::InvalidArgument` if the RAM tier is shut down
    pub fn remove(&self, id: EntryId) -> StorageResult<usize> {
        let removed = {
            let mut state = self.state.lock();
            if !state.known.contains_key(&id) {
                return Ok(0);
            }
            self.ram.remove(id)?;
            self.spill_remove(id);
            state.forget(id);
            1
        };
        self.listeners.notify(self);
        Ok(removed)
    }

    /// Register a size listener
    pub fn add_size_listener(&self, listener: Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.add(listener)
    }

    /// Unregister a size listener
    pub fn remove_size_listener(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.remove(listener)
    }

    /// Stop the RAM tier. The spill store is left alone.
    pub fn shutdown(&self) {
        self.ram.shutdown();
        self.listeners.clear();
    }

    fn ram_full(&self) -> bool {
        self.ram.num_entries() >= self.ram.max_entries() || self.ram.num_bytes() > self.ram.max_bytes()
    }

    /// Swap least recently touched entries out until the RAM tier accepts
    /// one more insert.
    fn make_room(&self) -> StorageResult<()> {
        let Some(spill) = &self.spill else { return Ok(()) };
        while self.ram_full() {
            let Some(victim) = self.ram.remove_oldest()? else { break };
            if victim.is_persistent() {
                // still held by the spill store
                victim.set_stored(true);
                continue;
            }
            if let Err(err) = self.spill_put(spill, &victim) {
                if let Err(restore) = self.ram.put(Arc::clone(&victim)) {
                    error!(
                        storage = %self.id,
                        entry = %victim.log_id(),
                        error = %restore,
                        "Failed to restore entry after a failed swap"
                    );
                }
                return Err(err);
            }
            debug!(storage = %self.id, entry = %victim.log_id(), "Swapped entry to spill store");
        }
        Ok(())
    }

    fn spill_put(&self, spill: &Arc<dyn SpillStore<E>>, entry: &Arc<E>) -> StorageResult<()> {
        if !spill.is_available() {
            return Err(StorageError::SpillUnavailable {
                storage_id: self.id.to_string(),
                reason: "spill store is not available".to_string(),
            });
        }
        spill.put(Arc::clone(entry)).map(|_| ()).map_err(|err| self.unavailable(&err))
    }

    fn spill_remove(&self, id: EntryId) {
        if let Some(spill) = &self.spill {
            if let Err(err) = spill.remove(id) {
                warn!(storage = %self.id, entry = %id, error = %err, "Failed to remove entry from spill store");
            }
        }
    }

    fn unavailable(&self, err: &StorageError) -> StorageError {
        StorageError::SpillUnavailable { storage_id: self.id.to_string(), reason: err.to_string() }
    }
}

impl<E: QueueEntry> StorageSize for SwappingStore<E> {
    fn storage_id(&self) -> &str {
        self.id.as_str()
    }

    fn num_entries(&self) -> u64 {
        self.state.lock().known.len() as u64
    }

    fn num_bytes(&self) -> u64 {
        self.state.lock().num_bytes
    }

    fn num_persistent_entries(&self) -> u64 {
        self.state.lock().num_persistent_entries
    }

    fn num_persistent_bytes(&self) -> u64 {
        self.state.lock().num_persistent_bytes
    }

    fn max_entries(&self) -> u64 {
        self.config.max_entries
    }

    fn max_bytes(&self) -> u64 {
        self.config.max_bytes
    }
}

impl<E: QueueEntry> EntryStore<E> for SwappingStore<E> {
    fn put(&self, entry: Arc<E>) -> StorageResult<usize> {
        SwappingStore::put(self, entry)
    }

    fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>> {
        SwappingStore::get(self, id)
    }

    fn contains(&self, id: EntryId) -> bool {
        SwappingStore::contains(self, id)
    }

    fn remove(&self, id: EntryId) -> StorageResult<usize> {
        SwappingStore::remove(self, id)
    }

    fn shutdown(&self) {
        SwappingStore::shutdown(self);
    }
}

impl<E: QueueEntry> fmt::Debug for SwappingStore<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwappingStore")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("ram", &self.ram)
            .field("has_spill", &self.spill.is_some())
            .finish()
    }
}
