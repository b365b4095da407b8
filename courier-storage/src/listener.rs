//! Registry of size listeners shared by all storages.

use crate::traits::{StorageSize, StorageSizeListener};
use parking_lot::Mutex;
use std::{fmt, sync::Arc};

/// Set of [`StorageSizeListener`]s, compared by pointer identity.
#[derive(Default)]
pub struct SizeListeners {
    listeners: Mutex<Vec<Arc<dyn StorageSizeListener>>>,
}

impl SizeListeners {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener. Returns `false` if it was already registered.
    pub fn add(&self, listener: Arc<dyn StorageSizeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        if listeners.iter().any(|known| Arc::ptr_eq(known, &listener)) {
            return false;
        }
        listeners.push(listener);
        true
    }

    /// Unregister a listener. Returns `false` if it was unknown.
    pub fn remove(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        let mut listeners = self.listeners.lock();
        let before = listeners.len();
        listeners.retain(|known| !Arc::ptr_eq(known, listener));
        listeners.len() != before
    }

    /// Whether the listener is registered.
    #[must_use]
    pub fn contains(&self, listener: &Arc<dyn StorageSizeListener>) -> bool {
        self.listeners.lock().iter().any(|known| Arc::ptr_eq(known, listener))
    }

    /// Drop every listener.
    pub fn clear(&self) {
        self.listeners.lock().clear();
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().len()
    }

    /// Whether no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.listeners.lock().is_empty()
    }

    /// Invoke every listener. The registry lock is not held during the
    /// callbacks, so listeners may (un)register themselves.
    pub fn notify(&self, storage: &dyn StorageSize) {
        let snapshot: Vec<Arc<dyn StorageSizeListener>> = self.listeners.lock().clone();
        for listener in snapshot {
            listener.storage_size_changed(storage);
        }
    }
}

impl fmt::Debug for SizeListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeListeners").field("len", &self.len()).finish()
    }
}
