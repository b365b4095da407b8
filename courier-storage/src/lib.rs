//! # Courier Storage
//!
//! Bounded, in-memory storages for queue entries:
//!
//! - [`BoundedStore`]: id keyed store with entry and byte limits and least
//!   recently touched eviction
//! - [`Backlog`]: a topic's undelivered entries in serving order
//! - [`SwappingStore`]: a RAM tier that swaps to an external [`SpillStore`]
//!
//! ```
//! use courier_core::MessageEntry;
//! use courier_storage::{BoundedStore, StoreConfig};
//! use std::sync::Arc;
//!
//! let store = BoundedStore::new("demo", StoreConfig::new().with_max_entries(2)).unwrap();
//! let entry = Arc::new(MessageEntry::builder("demo.topic").build().unwrap());
//! assert_eq!(store.put(Arc::clone(&entry)).unwrap(), 1);
//! assert_eq!(store.num_entries(), 1);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod backends;
pub mod backlog;
pub mod cache;
pub mod error;
pub mod listener;
pub mod traits;
pub mod types;

pub use backends::memory::{BoundedStore, StoreConfig, StoreMetrics, StoreMetricsSnapshot};
pub use backlog::Backlog;
pub use cache::{SwappingStore, SwappingStoreConfig};
pub use courier_core::QueueEntry;
pub use error::{ErrorSeverity, StorageError, StorageResult};
pub use listener::SizeListeners;
pub use traits::{EntryStore, SpillStore, StorageSize, StorageSizeListener};
pub use types::StorageId;
