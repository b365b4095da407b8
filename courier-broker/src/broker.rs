//! Topic registry.

use crate::{
    consumer::{Consumer, ConsumerId},
    dead_letter::{DeadLetterSink, LoggingDeadLetterSink},
    error::{BrokerError, BrokerResult},
    pool::DispatchPool,
    topic::{Topic, TopicStats},
};
use courier_core::{CourierConfig, EntryId, MessageEntry};
use courier_storage::SpillStore;
use dashmap::{mapref::entry::Entry, DashMap};
use serde::Serialize;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};
use tracing::info;

/// Broker-wide snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BrokerStats {
    /// Per-topic figures, sorted by name
    pub topics: Vec<TopicStats>,
    /// Configured worker limit
    pub max_workers: usize,
    /// Workers currently distributing
    pub busy_workers: usize,
}

/// Creates topics on demand and routes publishes and subscriptions to them.
///
/// All topics share one [`DispatchPool`], one dead-letter sink and, if one
/// is attached, one spill store.
pub struct Broker {
    config: CourierConfig,
    pool: DispatchPool,
    dead_letters: Arc<dyn DeadLetterSink>,
    spill: Option<Arc<dyn SpillStore<MessageEntry>>>,
    topics: DashMap<String, Arc<Topic>>,
    shut_down: AtomicBool,
}

impl Broker {
    /// Create a broker on the current tokio runtime.
    ///
    /// # Errors
    /// - `Core(Configuration)` if `config` fails validation
    /// - `Internal` outside a tokio runtime
    pub fn new(config: CourierConfig) -> BrokerResult<Self> {
        config.ensure_valid()?;
        let pool = DispatchPool::from_settings(&config.dispatch)?;
        info!(
            max_workers = config.dispatch.max_workers,
            store_max_entries = config.store.max_entries,
            backlog_max_entries = config.backlog.max_entries,
            "Broker created"
        );
        Ok(Self {
            config,
            pool,
            dead_letters: Arc::new(LoggingDeadLetterSink),
            spill: None,
            topics: DashMap::new(),
            shut_down: AtomicBool::new(false),
        })
    }

    /// Use `sink` for given-up entries of topics created from now on.
    #[must_use]
    pub fn with_dead_letter_sink(mut self, sink: Arc<dyn DeadLetterSink>) -> Self {
        self.dead_letters = sink;
        self
    }

    /// Swap message store overflow of topics created from now on to
    /// `spill`. Each topic then keeps at most the configured cache limits
    /// in RAM.
    #[must_use]
    pub fn with_spill_store(mut self, spill: Arc<dyn SpillStore<MessageEntry>>) -> Self {
        self.spill = Some(spill);
        self
    }

    /// Configuration the broker was built with
    #[must_use]
    pub fn config(&self) -> &CourierConfig {
        &self.config
    }

    /// Get a topic, creating it on first use.
    ///
    /// # Errors
    /// `ShutDown` after [`shutdown`](Self::shutdown), `InvalidArgument` for
    /// an empty name.
    pub fn topic(&self, name: &str) -> BrokerResult<Arc<Topic>> {
        self.ensure_running()?;
        if let Some(topic) = self.topics.get(name) {
            return Ok(Arc::clone(topic.value()));
        }

        let topic = match self.topics.entry(name.to_string()) {
            Entry::Occupied(existing) => return Ok(Arc::clone(existing.get())),
            Entry::Vacant(slot) => {
                let topic = Arc::new(Topic::new(
                    name,
                    &self.config,
                    self.pool.clone(),
                    Arc::clone(&self.dead_letters),
                    self.spill.clone(),
                )?);
                slot.insert(Arc::clone(&topic));
                topic
            },
        };

        // lost a race with shutdown
        if self.is_shutdown() {
            topic.shutdown();
            return Err(self.shut_down_error());
        }
        info!(topic = name, "Topic registered");
        Ok(topic)
    }

    /// Get a topic without creating it
    #[must_use]
    pub fn get_topic(&self, name: &str) -> Option<Arc<Topic>> {
        self.topics.get(name).map(|topic| Arc::clone(topic.value()))
    }

    /// Unregister a topic and shut it down
    pub fn remove_topic(&self, name: &str) -> Option<Arc<Topic>> {
        let (_, topic) = self.topics.remove(name)?;
        topic.shutdown();
        info!(topic = name, "Topic removed");
        Some(topic)
    }

    /// Names of all topics, sorted
    #[must_use]
    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.topics.iter().map(|topic| topic.key().clone()).collect();
        names.sort();
        names
    }

    /// Publish an entry to its topic, creating the topic if needed.
    ///
    /// # Errors
    /// See [`Topic::publish`].
    pub fn publish(&self, entry: MessageEntry) -> BrokerResult<EntryId> {
        let topic = self.topic(entry.topic())?;
        topic.publish(Arc::new(entry))
    }

    /// Subscribe a consumer to a topic, creating the topic if needed.
    ///
    /// # Errors
    /// See [`topic`](Self::topic).
    pub fn subscribe(&self, topic: &str, consumer: Arc<dyn Consumer>) -> BrokerResult<()> {
        self.topic(topic)?.subscribe(consumer);
        Ok(())
    }

    /// Unsubscribe a consumer. Returns it if it was subscribed.
    pub fn unsubscribe(&self, topic: &str, consumer: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        self.get_topic(topic)?.unsubscribe(consumer)
    }

    /// Shut every topic down and refuse new work. Idempotent.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let topics: Vec<Arc<Topic>> = self.topics.iter().map(|topic| Arc::clone(topic.value())).collect();
        for topic in &topics {
            topic.shutdown();
        }
        self.pool.close();
        info!(topics = topics.len(), "Broker shut down");
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Snapshot of every topic
    #[must_use]
    pub fn stats(&self) -> BrokerStats {
        let mut topics: Vec<TopicStats> = self.topics.iter().map(|topic| topic.value().stats()).collect();
        topics.sort_by(|a, b| a.name.cmp(&b.name));
        let max_workers = self.pool.max_workers();
        BrokerStats {
            topics,
            max_workers,
            busy_workers: max_workers.saturating_sub(self.pool.available_workers()),
        }
    }

    fn ensure_running(&self) -> BrokerResult<()> {
        if self.is_shutdown() {
            return Err(self.shut_down_error());
        }
        Ok(())
    }

    fn shut_down_error(&self) -> BrokerError {
        BrokerError::ShutDown { name: "broker".to_string() }
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("topics", &self.topics.len())
            .field("pool", &self.pool)
            .field("has_spill", &self.spill.is_some())
            .field("shut_down", &self.is_shutdown())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer::ChannelConsumer;

    #[tokio::test]
    async fn test_invalid_config_rejected() {
        let mut config = CourierConfig::default();
        config.dispatch.max_workers = 0;
        assert!(matches!(Broker::new(config), Err(BrokerError::Core(courier_core::Error::Configuration { .. }))));
    }

    #[tokio::test]
    async fn test_topics_created_on_demand() {
        let broker = Broker::new(CourierConfig::default()).unwrap();
        let first = broker.topic("b.topic").unwrap();
        let again = broker.topic("b.topic").unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        broker.topic("a.topic").unwrap();

        assert_eq!(broker.topic_names(), vec!["a.topic".to_string(), "b.topic".to_string()]);
        assert!(matches!(broker.topic(""), Err(BrokerError::InvalidArgument { .. })));
        assert!(broker.get_topic("missing").is_none());
    }

    #[tokio::test]
    async fn test_remove_topic_shuts_it_down() {
        let broker = Broker::new(CourierConfig::default()).unwrap();
        let (consumer, _inbox) = ChannelConsumer::new("c", 4);
        broker.subscribe("jobs", consumer).unwrap();

        let removed = broker.remove_topic("jobs").unwrap();
        assert!(removed.is_shutdown());
        assert!(broker.get_topic("jobs").is_none());
        assert!(broker.unsubscribe("jobs", &ConsumerId::new("c")).is_none());
    }

    #[tokio::test]
    async fn test_shutdown_refuses_work() {
        let broker = Broker::new(CourierConfig::default()).unwrap();
        let topic = broker.topic("jobs").unwrap();
        broker.shutdown();
        broker.shutdown();

        assert!(broker.is_shutdown());
        assert!(topic.is_shutdown());
        assert!(matches!(broker.topic("other"), Err(BrokerError::ShutDown { .. })));
        let entry = MessageEntry::builder("jobs").build().unwrap();
        assert!(matches!(broker.publish(entry), Err(BrokerError::ShutDown { .. })));
    }
}
