//! A topic wires a message store, a backlog and a distributor together.

use crate::{
    consumer::{Consumer, ConsumerId},
    dead_letter::DeadLetterSink,
    distributor::{ConsumableDistributor, DistributorStatsSnapshot},
    error::{BrokerError, BrokerResult},
    pool::DispatchPool,
};
use courier_core::{CourierConfig, EntryId, MessageEntry, QueueEntry};
use courier_storage::{
    Backlog, BoundedStore, EntryStore, SpillStore, StorageId, StorageSize, StoreConfig, SwappingStore,
    SwappingStoreConfig,
};
use serde::Serialize;
use std::{fmt, sync::Arc};
use tracing::{debug, info, warn};

/// Point-in-time view of a topic
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    /// Topic name
    pub name: String,
    /// Entries held by the store
    pub stored_entries: u64,
    /// Bytes held by the store
    pub stored_bytes: u64,
    /// Persistent entries held by the store
    pub persistent_entries: u64,
    /// Entries waiting for a consumer
    pub backlog_entries: usize,
    /// Registered consumers
    pub consumers: usize,
    /// Distribution counters
    pub distribution: DistributorStatsSnapshot,
}

/// A consumable topic: each published entry reaches exactly one consumer.
pub struct Topic {
    name: String,
    store: Arc<dyn EntryStore<MessageEntry>>,
    backlog: Arc<Backlog<MessageEntry>>,
    distributor: Arc<ConsumableDistributor>,
}

impl Topic {
    /// Build a topic with the limits of `config`.
    ///
    /// With a spill store the message store keeps at most the cache limits
    /// in RAM and swaps the rest out; without one it is a plain RAM store
    /// bounded by the total limits.
    ///
    /// # Errors
    /// Returns a storage configuration error if a limit is zero.
    pub fn new(
        name: impl Into<String>,
        config: &CourierConfig,
        pool: DispatchPool,
        dead_letters: Arc<dyn DeadLetterSink>,
        spill: Option<Arc<dyn SpillStore<MessageEntry>>>,
    ) -> BrokerResult<Self> {
        let name = name.into();
        if name.is_empty() {
            return Err(BrokerError::invalid_argument("topic name must not be empty"));
        }

        let store_id = StorageId::for_topic(&name, "store");
        let store: Arc<dyn EntryStore<MessageEntry>> = match spill {
            Some(spill) => Arc::new(SwappingStore::new(
                store_id,
                SwappingStoreConfig::from(&config.store),
                Some(spill),
            )?),
            None => Arc::new(BoundedStore::new(store_id, StoreConfig::from(&config.store))?),
        };
        let backlog = Arc::new(Backlog::new(StorageId::for_topic(&name, "backlog"), config.backlog.max_entries)?);
        let distributor = ConsumableDistributor::new(
            name.clone(),
            Arc::clone(&store),
            Arc::clone(&backlog),
            pool,
            dead_letters,
            config.dispatch.redeliver_limit,
        );

        debug!(topic = %name, "Topic created");
        Ok(Self { name, store, backlog, distributor })
    }

    /// Topic name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store an entry and hand it to the distributor.
    ///
    /// Publishing an id the store already holds changes nothing.
    ///
    /// # Errors
    /// - `InvalidArgument` if the entry names another topic
    /// - `ShutDown` after [`shutdown`](Self::shutdown)
    /// - the store's or backlog's error if either is full; the store keeps
    ///   nothing in that case
    pub fn publish(&self, entry: Arc<MessageEntry>) -> BrokerResult<EntryId> {
        if entry.topic() != self.name {
            return Err(BrokerError::invalid_argument(format!(
                "entry for topic '{}' published to '{}'",
                entry.topic(),
                self.name
            )));
        }
        if self.distributor.is_shutdown() {
            return Err(BrokerError::ShutDown { name: self.name.clone() });
        }

        let id = entry.unique_id();
        if self.store.put(Arc::clone(&entry))? == 0 {
            debug!(topic = %self.name, entry = %entry.log_id(), "Entry already published");
            return Ok(id);
        }
        if let Err(err) = self.backlog.put(entry) {
            if let Err(rollback) = self.store.remove(id) {
                warn!(topic = %self.name, entry = %id, error = %rollback, "Failed to roll back store insert");
            }
            return Err(err.into());
        }

        self.distributor.notify_new_entry();
        Ok(id)
    }

    /// Add a consumer to the round-robin ring.
    pub fn subscribe(&self, consumer: Arc<dyn Consumer>) {
        self.distributor.on_consumer_added(consumer);
    }

    /// Remove a consumer. Returns it if it was subscribed.
    pub fn unsubscribe(&self, id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.distributor.on_consumer_removed(id)
    }

    /// Stop distribution, then release the store.
    pub fn shutdown(&self) {
        self.distributor.shutdown();
        self.store.shutdown();
        info!(topic = %self.name, undelivered = self.backlog.len(), "Topic shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.distributor.is_shutdown()
    }

    /// Snapshot of counters and sizes
    #[must_use]
    pub fn stats(&self) -> TopicStats {
        TopicStats {
            name: self.name.clone(),
            stored_entries: self.store.num_entries(),
            stored_bytes: self.store.num_bytes(),
            persistent_entries: self.store.num_persistent_entries(),
            backlog_entries: self.backlog.len(),
            consumers: self.distributor.consumer_count(),
            distribution: self.distributor.stats(),
        }
    }

    /// Message store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn EntryStore<MessageEntry>> {
        &self.store
    }

    /// Undelivered entries in drain order
    #[must_use]
    pub fn backlog(&self) -> &Arc<Backlog<MessageEntry>> {
        &self.backlog
    }

    /// Distributor
    #[must_use]
    pub fn distributor(&self) -> &Arc<ConsumableDistributor> {
        &self.distributor
    }
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic")
            .field("name", &self.name)
            .field("store", &self.store)
            .field("backlog", &self.backlog.len())
            .field("distributor", &self.distributor)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dead_letter::LoggingDeadLetterSink;

    fn topic_with(config: &CourierConfig) -> Topic {
        Topic::new("orders", config, DispatchPool::new(2).unwrap(), Arc::new(LoggingDeadLetterSink), None).unwrap()
    }

    fn entry(topic: &str) -> Arc<MessageEntry> {
        Arc::new(MessageEntry::builder(topic).with_payload("x").build().unwrap())
    }

    #[tokio::test]
    async fn test_rejects_foreign_entry() {
        let topic = topic_with(&CourierConfig::default());
        let err = topic.publish(entry("payments")).unwrap_err();
        assert!(matches!(err, BrokerError::InvalidArgument { .. }));
        assert_eq!(topic.stats().stored_entries, 0);
    }

    #[tokio::test]
    async fn test_store_overflow_reaches_publisher() {
        let mut config = CourierConfig::default();
        config.store.max_entries = 2;
        let topic = topic_with(&config);

        topic.publish(entry("orders")).unwrap();
        topic.publish(entry("orders")).unwrap();
        let err = topic.publish(entry("orders")).unwrap_err();
        assert!(err.is_recoverable());
        assert_eq!(topic.store().num_entries(), 2);
        assert_eq!(topic.backlog().len(), 2);
    }

    #[tokio::test]
    async fn test_backlog_overflow_rolls_back_store() {
        let mut config = CourierConfig::default();
        config.backlog.max_entries = 1;
        let topic = topic_with(&config);

        topic.publish(entry("orders")).unwrap();
        let rejected = entry("orders");
        assert!(topic.publish(Arc::clone(&rejected)).is_err());
        assert!(!topic.store().contains(rejected.unique_id()));
        assert_eq!(topic.store().num_entries(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_publish_is_noop() {
        let topic = topic_with(&CourierConfig::default());
        let first = entry("orders");
        let id = topic.publish(Arc::clone(&first)).unwrap();
        assert_eq!(topic.publish(first).unwrap(), id);
        assert_eq!(topic.stats().stored_entries, 1);
        assert_eq!(topic.stats().backlog_entries, 1);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_publish() {
        let topic = topic_with(&CourierConfig::default());
        topic.shutdown();
        assert!(topic.is_shutdown());
        assert!(matches!(topic.publish(entry("orders")), Err(BrokerError::ShutDown { .. })));
    }

    #[tokio::test]
    async fn test_empty_name_rejected() {
        let result = Topic::new(
            "",
            &CourierConfig::default(),
            DispatchPool::new(1).unwrap(),
            Arc::new(LoggingDeadLetterSink),
            None,
        );
        assert!(matches!(result, Err(BrokerError::InvalidArgument { .. })));
    }

    #[tokio::test]
    async fn test_spill_store_takes_overflow_and_reloads() {
        let mut config = CourierConfig::default();
        config.store.max_entries_cache = 1;
        let spill = Arc::new(BoundedStore::new("orders/spill", StoreConfig::new()).unwrap());
        let topic = Topic::new(
            "orders",
            &config,
            DispatchPool::new(2).unwrap(),
            Arc::new(LoggingDeadLetterSink),
            Some(Arc::clone(&spill) as Arc<dyn SpillStore<MessageEntry>>),
        )
        .unwrap();

        let first = entry("orders");
        let second = entry("orders");
        topic.publish(Arc::clone(&first)).unwrap();
        topic.publish(Arc::clone(&second)).unwrap();
        assert_eq!(topic.stats().stored_entries, 2);
        assert!(spill.contains(first.unique_id()));
        assert!(!spill.contains(second.unique_id()));

        let reloaded = topic.store().get(first.unique_id()).unwrap().unwrap();
        assert_eq!(reloaded.unique_id(), first.unique_id());
        assert!(!spill.contains(first.unique_id()));
        assert!(spill.contains(second.unique_id()));

        let (consumer, mut inbox) = crate::consumer::ChannelConsumer::new("reader", 4);
        topic.subscribe(consumer);
        for _ in 0..2 {
            let delivered = tokio::time::timeout(std::time::Duration::from_secs(2), inbox.recv()).await;
            assert!(delivered.unwrap().is_some());
        }
        for _ in 0..400 {
            if topic.stats().stored_entries == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(topic.stats().stored_entries, 0);
        assert_eq!(spill.num_entries(), 0);
    }
}
