//! Storage traits and interfaces.
//!
//! [`StorageSize`] is the read-only view every storage exposes to size
//! listeners. [`EntryStore`] is what a topic needs from its message store,
//! so a plain RAM store and a swapping one are interchangeable.
//! [`SpillStore`] is the seam to an external persistence backend:
//! the swapping cache writes evicted entries through it and reloads them on a
//! miss. No durable implementation lives in this crate.

use crate::error::StorageResult;
use courier_core::{EntryId, QueueEntry};
use std::{fmt, sync::Arc};

/// Counters of a storage, as seen by listeners and operators.
pub trait StorageSize: Send + Sync {
    /// Human readable storage name.
    fn storage_id(&self) -> &str;

    /// Entries currently held.
    fn num_entries(&self) -> u64;

    /// Sum of the `size_in_bytes` of all entries held.
    fn num_bytes(&self) -> u64;

    /// Entries held with the persistent flag set.
    fn num_persistent_entries(&self) -> u64;

    /// Bytes of the persistent entries held.
    fn num_persistent_bytes(&self) -> u64;

    /// Configured entry limit.
    fn max_entries(&self) -> u64;

    /// Configured byte limit.
    fn max_bytes(&self) -> u64;
}

/// Id keyed message store of a topic.
pub trait EntryStore<E: QueueEntry>: StorageSize + fmt::Debug {
    /// Insert an entry. Returns 0 if the id is already held.
    ///
    /// # Errors
    /// Returns an error if a limit is reached or the store is shut down.
    fn put(&self, entry: Arc<E>) -> StorageResult<usize>;

    /// Look an entry up.
    ///
    /// # Errors
    /// Returns an error if a backing tier cannot be read.
    fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>>;

    /// Whether an entry with this id is held.
    fn contains(&self, id: EntryId) -> bool;

    /// Remove an entry. Returns the number of entries removed.
    ///
    /// # Errors
    /// Returns an error if the store is shut down.
    fn remove(&self, id: EntryId) -> StorageResult<usize>;

    /// Stop accepting mutations.
    fn shutdown(&self);
}

/// Callback invoked after every size-affecting mutation.
///
/// The storage lock is already released when this runs, so implementations
/// may call back into the storage.
pub trait StorageSizeListener: Send + Sync {
    /// The storage changed size.
    fn storage_size_changed(&self, storage: &dyn StorageSize);
}

/// External persistence collaborator used for swapping.
///
/// Implementations decide themselves how to make entries durable; the cache
/// only relies on the contract that an entry `put` here can be fetched back
/// with `get` until it is removed.
pub trait SpillStore<E: QueueEntry>: Send + Sync {
    /// Persist an entry. Returns the number of entries added (0 if already
    /// present).
    ///
    /// # Errors
    /// Returns an error if the backend cannot take the entry.
    fn put(&self, entry: Arc<E>) -> StorageResult<usize>;

    /// Fetch a previously spilled entry.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be read.
    fn get(&self, id: EntryId) -> StorageResult<Option<Arc<E>>>;

    /// Delete an entry. Returns the number of entries removed.
    ///
    /// # Errors
    /// Returns an error if the backend cannot be written.
    fn remove(&self, id: EntryId) -> StorageResult<usize>;

    /// Entries held by the backend.
    fn num_entries(&self) -> u64;

    /// Bytes held by the backend.
    fn num_bytes(&self) -> u64;

    /// Entry limit of the backend.
    fn max_entries(&self) -> u64;

    /// Byte limit of the backend.
    fn max_bytes(&self) -> u64;

    /// Whether the backend currently accepts calls.
    fn is_available(&self) -> bool {
        true
    }
}
