//! Consumable distribution: every entry of a topic goes to exactly one
//! consumer.
//!
//! The distributor is either idle or running one worker. Triggers (a new
//! entry, a new consumer, a consumer coming back) start a worker on the
//! [`DispatchPool`] unless one is already running, in which case the worker
//! is told to look at the backlog once more before it parks. The worker
//! serves the backlog head first, offering each entry to the consumers in
//! round-robin order:
//!
//! - a consumer that took an entry is moved to the end of the ring
//! - a communication failure moves on to the next consumer
//! - any other failure, a failing filter or a panic gives the entry up
//!   (dead letter) and removes it
//! - a dirty-read consumer cannot take part; the entry is dropped
//!
//! When no consumer takes the head entry the worker parks and the
//! distributor stays parked until a consumer is added or becomes reachable.

use crate::{
    consumer::{Consumer, ConsumerId, DeliveryMode, ReachabilityListener},
    dead_letter::DeadLetterSink,
    error::BrokerError,
    pool::DispatchPool,
};
use courier_core::{MessageEntry, QueueEntry, ReturnValue};
use courier_storage::{Backlog, EntryStore};
use futures::FutureExt;
use parking_lot::Mutex;
use serde::Serialize;
use std::{
    any::Any,
    collections::VecDeque,
    fmt,
    panic::AssertUnwindSafe,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tracing::{debug, error, info, trace, warn};

/// Distribution counters
#[derive(Debug, Default)]
pub struct DistributorStats {
    /// Entries taken by a consumer
    pub delivered: AtomicU64,
    /// Entries given up and dead-lettered
    pub dead_lettered: AtomicU64,
    /// Entries dropped because a dirty-read consumer matched
    pub dropped_dirty_read: AtomicU64,
    /// Entries dropped because they expired in the backlog
    pub expired: AtomicU64,
    /// Communication failures, each followed by a try on the next consumer
    pub transient_failures: AtomicU64,
    /// Workers started
    pub worker_runs: AtomicU64,
}

impl DistributorStats {
    fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy
    #[must_use]
    pub fn snapshot(&self) -> DistributorStatsSnapshot {
        DistributorStatsSnapshot {
            delivered: self.delivered.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            dropped_dirty_read: self.dropped_dirty_read.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            transient_failures: self.transient_failures.load(Ordering::Relaxed),
            worker_runs: self.worker_runs.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`DistributorStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DistributorStatsSnapshot {
    /// Entries taken by a consumer
    pub delivered: u64,
    /// Entries given up and dead-lettered
    pub dead_lettered: u64,
    /// Entries dropped because a dirty-read consumer matched
    pub dropped_dirty_read: u64,
    /// Entries dropped because they expired in the backlog
    pub expired: u64,
    /// Communication failures
    pub transient_failures: u64,
    /// Workers started
    pub worker_runs: u64,
}

struct DistributorState {
    /// Round-robin ring; the consumer that took the last entry sits at the back.
    consumers: VecDeque<Arc<dyn Consumer>>,
    running: bool,
    ready: bool,
    /// A trigger arrived while the worker was running.
    pending: bool,
    shut_down: bool,
}

enum Outcome {
    Delivered,
    GivenUp,
    Dropped,
    NotTaken,
}

/// Distributor of one topic's backlog
pub struct ConsumableDistributor {
    topic: String,
    store: Arc<dyn EntryStore<MessageEntry>>,
    backlog: Arc<Backlog<MessageEntry>>,
    pool: DispatchPool,
    dead_letters: Arc<dyn DeadLetterSink>,
    redeliver_limit: u32,
    state: Mutex<DistributorState>,
    stats: DistributorStats,
    me: Weak<ConsumableDistributor>,
}

impl ConsumableDistributor {
    /// Create a distributor for a topic's store and backlog.
    ///
    /// Entries that failed `redeliver_limit` times are dead-lettered before
    /// the next attempt; 0 disables the limit.
    pub fn new(
        topic: impl Into<String>,
        store: Arc<dyn EntryStore<MessageEntry>>,
        backlog: Arc<Backlog<MessageEntry>>,
        pool: DispatchPool,
        dead_letters: Arc<dyn DeadLetterSink>,
        redeliver_limit: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            topic: topic.into(),
            store,
            backlog,
            pool,
            dead_letters,
            redeliver_limit,
            state: Mutex::new(DistributorState {
                consumers: VecDeque::new(),
                running: false,
                ready: true,
                pending: false,
                shut_down: false,
            }),
            stats: DistributorStats::default(),
            me: me.clone(),
        })
    }

    /// Topic name
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// An entry was added to the backlog. Never blocks on distribution.
    pub fn notify_new_entry(&self) {
        self.to_running(false);
    }

    /// Register a consumer and start distributing.
    pub fn on_consumer_added(&self, consumer: Arc<dyn Consumer>) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                warn!(topic = %self.topic, consumer = %consumer.id(), "Distributor is shut down, ignoring consumer");
                return;
            }
            if state.consumers.iter().any(|known| known.id() == consumer.id()) {
                debug!(topic = %self.topic, consumer = %consumer.id(), "Consumer already registered");
            } else {
                state.consumers.push_back(Arc::clone(&consumer));
            }
        }
        consumer.add_reachability_listener(self.listener_handle());
        info!(topic = %self.topic, consumer = %consumer.id(), "Consumer added");
        self.to_running(true);
    }

    /// Unregister a consumer. An in-flight delivery to it is not affected.
    pub fn on_consumer_removed(&self, id: &ConsumerId) -> Option<Arc<dyn Consumer>> {
        let removed = {
            let mut state = self.state.lock();
            let position = state.consumers.iter().position(|known| known.id() == id)?;
            state.consumers.remove(position)
        };
        if let Some(consumer) = &removed {
            consumer.remove_reachability_listener(&self.listener_handle());
            info!(topic = %self.topic, consumer = %id, "Consumer removed");
        }
        removed
    }

    /// A consumer became reachable or unreachable.
    pub fn on_consumer_reachability_changed(&self, id: &ConsumerId, reachable: bool) {
        if reachable {
            debug!(topic = %self.topic, consumer = %id, "Consumer reachable again");
            self.to_running(true);
        } else {
            // the worker skips it on its next pass
            debug!(topic = %self.topic, consumer = %id, "Consumer unreachable");
        }
    }

    /// Stop distributing. A running worker finishes its current entry and
    /// exits; nothing re-arms the distributor afterwards.
    pub fn shutdown(&self) {
        let consumers: Vec<Arc<dyn Consumer>> = {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            state.shut_down = true;
            state.ready = false;
            state.pending = false;
            state.consumers.drain(..).collect()
        };
        let handle = self.listener_handle();
        for consumer in &consumers {
            consumer.remove_reachability_listener(&handle);
        }
        info!(topic = %self.topic, consumers = consumers.len(), "Distributor shut down");
    }

    /// Whether a worker is running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state.lock().running
    }

    /// Whether triggers start a worker
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    /// Whether [`shutdown`](Self::shutdown) was called
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.state.lock().shut_down
    }

    /// Consumers in the order the next entry is offered to them
    #[must_use]
    pub fn consumer_order(&self) -> Vec<ConsumerId> {
        self.state.lock().consumers.iter().map(|c| c.id().clone()).collect()
    }

    /// Number of registered consumers
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.state.lock().consumers.len()
    }

    /// Distribution counters
    #[must_use]
    pub fn stats(&self) -> DistributorStatsSnapshot {
        self.stats.snapshot()
    }

    fn listener_handle(&self) -> Weak<dyn ReachabilityListener> {
        let handle: Weak<dyn ReachabilityListener> = self.me.clone();
        handle
    }

    /// Start a worker unless one is running. `rearm` also wakes a parked
    /// distributor.
    fn to_running(&self, rearm: bool) {
        {
            let mut state = self.state.lock();
            if state.shut_down {
                return;
            }
            if rearm {
                state.ready = true;
            }
            if !state.ready {
                trace!(topic = %self.topic, "Distributor parked, waiting for a consumer");
                return;
            }
            if state.running {
                state.pending = true;
                return;
            }
            state.running = true;
            state.pending = false;
        }

        let Some(this) = self.me.upgrade() else {
            self.state.lock().running = false;
            return;
        };
        DistributorStats::incr(&self.stats.worker_runs);
        self.pool.execute(async move { this.run_worker().await });
    }

    async fn run_worker(self: Arc<Self>) {
        trace!(topic = %self.topic, "Distribution worker started");
        let result = AssertUnwindSafe(self.process_backlog()).catch_unwind().await;
        if let Err(panic) = result {
            error!(
                topic = %self.topic,
                panic = %panic_message(panic.as_ref()),
                "Distribution worker failed, parked until a consumer re-arms it"
            );
            let mut state = self.state.lock();
            state.running = false;
            state.ready = false;
            state.pending = false;
        }
    }

    async fn process_backlog(&self) {
        loop {
            if !self.keep_running() {
                return;
            }
            let Some(entry) = self.backlog.peek_first() else {
                if self.park(false) {
                    return;
                }
                continue;
            };

            if entry.is_expired() {
                debug!(topic = %self.topic, entry = %entry.log_id(), "Dropping expired entry");
                self.discard(&entry);
                DistributorStats::incr(&self.stats.expired);
                continue;
            }
            if self.redeliver_limit > 0 && entry.redeliver_count() >= self.redeliver_limit {
                let error = BrokerError::RedeliverLimit { limit: self.redeliver_limit };
                self.give_up(&entry, None, &error);
                continue;
            }

            if let Outcome::NotTaken = self.distribute_one(&entry).await {
                if self.park(true) {
                    return;
                }
            }
        }
    }

    fn keep_running(&self) -> bool {
        let mut state = self.state.lock();
        if state.ready && !state.shut_down {
            return true;
        }
        state.running = false;
        state.pending = false;
        false
    }

    /// Stop the worker unless a trigger arrived meanwhile. Returns whether
    /// the worker stopped.
    fn park(&self, no_taker: bool) -> bool {
        let mut state = self.state.lock();
        if state.pending && !state.shut_down {
            state.pending = false;
            return false;
        }
        state.running = false;
        state.pending = false;
        if no_taker {
            state.ready = false;
            debug!(topic = %self.topic, backlog = self.backlog.len(), "No consumer took the head entry, parking");
        }
        true
    }

    async fn distribute_one(&self, entry: &Arc<MessageEntry>) -> Outcome {
        let consumers: Vec<Arc<dyn Consumer>> = self.state.lock().consumers.iter().cloned().collect();

        for consumer in consumers {
            if !consumer.is_reachable() || !consumer.is_eligible(entry) {
                continue;
            }

            if consumer.delivery_mode() == DeliveryMode::DirtyRead {
                error!(
                    topic = %self.topic,
                    consumer = %consumer.id(),
                    entry = %entry.log_id(),
                    "Dirty-read consumer cannot take part in consumable distribution, dropping entry"
                );
                self.discard(entry);
                DistributorStats::incr(&self.stats.dropped_dirty_read);
                return Outcome::Dropped;
            }

            match consumer.matches_filter(entry) {
                Ok(true) => {},
                Ok(false) => {
                    trace!(topic = %self.topic, consumer = %consumer.id(), "Filter rejected entry");
                    continue;
                },
                Err(err) => {
                    let error = BrokerError::Filter { consumer: consumer.id().to_string(), reason: err.reason };
                    self.give_up(entry, Some(consumer.as_ref()), &error);
                    return Outcome::GivenUp;
                },
            }

            let dispatched = Arc::new(entry.clone_for_dispatch());
            let attempt = AssertUnwindSafe(consumer.deliver(Arc::clone(&dispatched))).catch_unwind().await;
            match attempt {
                Ok(Ok(())) => {
                    self.discard(entry);
                    dispatched.set_return_value(ReturnValue::Delivered { consumer: consumer.id().to_string() });
                    self.rotate_to_tail(consumer.id());
                    DistributorStats::incr(&self.stats.delivered);
                    debug!(topic = %self.topic, consumer = %consumer.id(), entry = %entry.log_id(), "Delivered");
                    return Outcome::Delivered;
                },
                Ok(Err(err)) if err.is_communication() => {
                    entry.incr_redeliver_count();
                    DistributorStats::incr(&self.stats.transient_failures);
                    warn!(
                        topic = %self.topic,
                        consumer = %consumer.id(),
                        entry = %entry.log_id(),
                        error = %err,
                        "Delivery failed, trying next consumer"
                    );
                },
                Ok(Err(err)) => {
                    entry.incr_redeliver_count();
                    let error = BrokerError::Delivery { consumer: consumer.id().to_string(), reason: err.to_string() };
                    self.give_up(entry, Some(consumer.as_ref()), &error);
                    return Outcome::GivenUp;
                },
                Err(panic) => {
                    entry.incr_redeliver_count();
                    let error = BrokerError::ConsumerPanic {
                        consumer: consumer.id().to_string(),
                        message: panic_message(panic.as_ref()),
                    };
                    self.give_up(entry, Some(consumer.as_ref()), &error);
                    return Outcome::GivenUp;
                },
            }
        }
        Outcome::NotTaken
    }

    fn give_up(&self, entry: &Arc<MessageEntry>, consumer: Option<&dyn Consumer>, error: &BrokerError) {
        let reason = error.to_string();
        warn!(topic = %self.topic, entry = %entry.log_id(), error = %reason, "Giving up on entry");
        if let Some(consumer) = consumer {
            consumer.on_internal_error(entry, error);
        }
        self.dead_letters.dead_letter(std::slice::from_ref(entry), &reason);
        entry.set_return_value(ReturnValue::Failed { reason });
        self.discard(entry);
        DistributorStats::incr(&self.stats.dead_lettered);
    }

    /// Remove an entry from backlog and store.
    fn discard(&self, entry: &MessageEntry) {
        self.backlog.remove(entry);
        if let Err(err) = self.store.remove(entry.unique_id()) {
            warn!(topic = %self.topic, entry = %entry.log_id(), error = %err, "Failed to remove entry from store");
        }
    }

    fn rotate_to_tail(&self, id: &ConsumerId) {
        let mut state = self.state.lock();
        if let Some(position) = state.consumers.iter().position(|c| c.id() == id) {
            if let Some(consumer) = state.consumers.remove(position) {
                state.consumers.push_back(consumer);
            }
        }
    }
}

impl ReachabilityListener for ConsumableDistributor {
    fn reachability_changed(&self, consumer: &ConsumerId, reachable: bool) {
        self.on_consumer_reachability_changed(consumer, reachable);
    }

    fn consumer_lost(&self, consumer: &ConsumerId) {
        debug!(topic = %self.topic, consumer = %consumer, "Consumer lost");
        self.on_consumer_removed(consumer);
    }
}

impl fmt::Debug for ConsumableDistributor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("ConsumableDistributor")
            .field("topic", &self.topic)
            .field("consumers", &state.consumers.len())
            .field("running", &state.running)
            .field("ready", &state.ready)
            .field("shut_down", &state.shut_down)
            .finish()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        consumer::{DeliveryError, FilterError, ReachabilityListeners},
        dead_letter::DeadLetterBuffer,
    };
    use async_trait::async_trait;
    use chrono::{Duration as ChronoDuration, Utc};
    use courier_core::Priority;
    use courier_storage::{BoundedStore, StoreConfig};
    use std::{
        sync::atomic::{AtomicBool, AtomicUsize},
        time::Duration,
    };
    use tokio::sync::watch;

    #[derive(Debug, Clone, Copy)]
    enum Step {
        Accept,
        Transient,
        Reject,
        Panic,
    }

    #[derive(Debug, Clone, Copy)]
    enum Filter {
        Match,
        Skip,
        Fail,
    }

    #[derive(Debug)]
    struct MockConsumer {
        id: ConsumerId,
        reachable: AtomicBool,
        mode: DeliveryMode,
        filter: Filter,
        script: Mutex<VecDeque<Step>>,
        gate: Option<watch::Receiver<bool>>,
        attempts: AtomicUsize,
        received: Mutex<Vec<Arc<MessageEntry>>>,
        internal_errors: AtomicUsize,
        listeners: ReachabilityListeners,
    }

    impl MockConsumer {
        fn new(id: &str) -> Self {
            Self {
                id: ConsumerId::new(id),
                reachable: AtomicBool::new(true),
                mode: DeliveryMode::Exclusive,
                filter: Filter::Match,
                script: Mutex::new(VecDeque::new()),
                gate: None,
                attempts: AtomicUsize::new(0),
                received: Mutex::new(Vec::new()),
                internal_errors: AtomicUsize::new(0),
                listeners: ReachabilityListeners::new(),
            }
        }

        fn with_steps(self, steps: &[Step]) -> Self {
            self.script.lock().extend(steps.iter().copied());
            self
        }

        fn with_filter(mut self, filter: Filter) -> Self {
            self.filter = filter;
            self
        }

        fn dirty_read(mut self) -> Self {
            self.mode = DeliveryMode::DirtyRead;
            self
        }

        fn unreachable(self) -> Self {
            self.reachable.store(false, Ordering::SeqCst);
            self
        }

        fn gated(mut self, gate: watch::Receiver<bool>) -> Self {
            self.gate = Some(gate);
            self
        }

        fn set_reachable(&self, reachable: bool) {
            self.reachable.store(reachable, Ordering::SeqCst);
            self.listeners.notify(&self.id, reachable);
        }

        fn received_ids(&self) -> Vec<u64> {
            self.received.lock().iter().map(|e| e.unique_id().as_u64()).collect()
        }
    }

    #[async_trait]
    impl Consumer for MockConsumer {
        fn id(&self) -> &ConsumerId {
            &self.id
        }

        fn is_reachable(&self) -> bool {
            self.reachable.load(Ordering::SeqCst)
        }

        fn delivery_mode(&self) -> DeliveryMode {
            self.mode
        }

        fn matches_filter(&self, _entry: &MessageEntry) -> Result<bool, FilterError> {
            match self.filter {
                Filter::Match => Ok(true),
                Filter::Skip => Ok(false),
                Filter::Fail => Err(FilterError::new("selector does not parse")),
            }
        }

        async fn deliver(&self, entry: Arc<MessageEntry>) -> Result<(), DeliveryError> {
            self.attempts.fetch_add(1, Ordering::SeqCst);
            if let Some(gate) = &self.gate {
                let mut gate = gate.clone();
                let _ = gate.wait_for(|open| *open).await;
            }
            let step = self.script.lock().pop_front().unwrap_or(Step::Accept);
            match step {
                Step::Accept => {
                    self.received.lock().push(entry);
                    Ok(())
                },
                Step::Transient => Err(DeliveryError::communication("connection reset")),
                Step::Reject => Err(DeliveryError::rejected("payload too large")),
                Step::Panic => panic!("consumer exploded"),
            }
        }

        fn on_internal_error(&self, _entry: &MessageEntry, _error: &BrokerError) {
            self.internal_errors.fetch_add(1, Ordering::SeqCst);
        }

        fn add_reachability_listener(&self, listener: Weak<dyn ReachabilityListener>) {
            self.listeners.add(listener);
        }

        fn remove_reachability_listener(&self, listener: &Weak<dyn ReachabilityListener>) {
            self.listeners.remove(listener);
        }
    }

    struct Fixture {
        store: Arc<BoundedStore<MessageEntry>>,
        backlog: Arc<Backlog<MessageEntry>>,
        dead: Arc<DeadLetterBuffer>,
        distributor: Arc<ConsumableDistributor>,
    }

    impl Fixture {
        fn new(redeliver_limit: u32) -> Self {
            let store = Arc::new(BoundedStore::new("test/store", StoreConfig::new().with_max_entries(100)).unwrap());
            let backlog = Arc::new(Backlog::new("test/backlog", 100).unwrap());
            let dead = Arc::new(DeadLetterBuffer::new(16));
            let distributor = ConsumableDistributor::new(
                "test",
                Arc::clone(&store) as Arc<dyn EntryStore<MessageEntry>>,
                Arc::clone(&backlog),
                DispatchPool::new(4).unwrap(),
                Arc::clone(&dead) as Arc<dyn DeadLetterSink>,
                redeliver_limit,
            );
            Self { store, backlog, dead, distributor }
        }

        fn publish_entry(&self, entry: MessageEntry) -> Arc<MessageEntry> {
            let entry = Arc::new(entry);
            self.store.put(Arc::clone(&entry)).unwrap();
            self.backlog.put(Arc::clone(&entry)).unwrap();
            self.distributor.notify_new_entry();
            entry
        }

        fn publish(&self) -> Arc<MessageEntry> {
            self.publish_entry(MessageEntry::builder("test").want_return_value(true).build().unwrap())
        }

        fn add(&self, consumer: &Arc<MockConsumer>) {
            self.distributor.on_consumer_added(Arc::clone(consumer) as Arc<dyn Consumer>);
        }

        fn stats(&self) -> DistributorStatsSnapshot {
            self.distributor.stats()
        }

        fn is_parked(&self) -> bool {
            !self.distributor.is_running() && !self.distributor.is_ready()
        }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..400 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached in time");
    }

    #[tokio::test]
    async fn test_every_entry_delivered_exactly_once() {
        let fixture = Fixture::new(0);
        let published: Vec<u64> = (0..10).map(|_| fixture.publish().unique_id().as_u64()).collect();

        // nobody to deliver to yet
        wait_until(|| fixture.is_parked()).await;

        let consumer = Arc::new(MockConsumer::new("only"));
        fixture.add(&consumer);
        wait_until(|| fixture.stats().delivered == 10).await;
        wait_until(|| !fixture.distributor.is_running()).await;

        assert_eq!(consumer.received_ids(), published);
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 10);
        assert!(fixture.backlog.is_empty());
        assert_eq!(fixture.store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_consumers_take_turns() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a"));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);
        let entries: Vec<_> = (0..4).map(|_| fixture.publish()).collect();

        wait_until(|| fixture.stats().delivered == 4).await;

        let ids: Vec<u64> = entries.iter().map(|e| e.unique_id().as_u64()).collect();
        assert_eq!(a.received_ids(), vec![ids[0], ids[2]]);
        assert_eq!(b.received_ids(), vec![ids[1], ids[3]]);
        assert_eq!(fixture.distributor.consumer_order(), vec![ConsumerId::new("a"), ConsumerId::new("b")]);
        assert_eq!(entries[1].return_value(), Some(&ReturnValue::Delivered { consumer: "b".to_string() }));
    }

    #[tokio::test]
    async fn test_higher_priority_served_first() {
        let fixture = Fixture::new(0);
        let low = fixture.publish_entry(MessageEntry::builder("test").with_priority(Priority::LOW).build().unwrap());
        let high = fixture.publish_entry(MessageEntry::builder("test").with_priority(Priority::HIGH).build().unwrap());
        wait_until(|| fixture.is_parked()).await;

        let consumer = Arc::new(MockConsumer::new("c"));
        fixture.add(&consumer);
        wait_until(|| fixture.stats().delivered == 2).await;
        assert_eq!(consumer.received_ids(), vec![high.unique_id().as_u64(), low.unique_id().as_u64()]);
    }

    #[tokio::test]
    async fn test_dirty_read_consumer_never_receives() {
        let fixture = Fixture::new(0);
        let peeker = Arc::new(MockConsumer::new("peeker").dirty_read());
        fixture.add(&peeker);
        fixture.publish();

        wait_until(|| fixture.stats().dropped_dirty_read == 1).await;
        assert_eq!(peeker.attempts.load(Ordering::SeqCst), 0);
        assert!(fixture.backlog.is_empty());
        assert_eq!(fixture.store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_communication_failure_tries_next_consumer() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a").with_steps(&[Step::Transient]));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);
        let entry = fixture.publish();

        wait_until(|| fixture.stats().delivered == 1).await;
        assert!(a.received_ids().is_empty());
        assert_eq!(b.received_ids(), vec![entry.unique_id().as_u64()]);
        assert_eq!(entry.redeliver_count(), 1);
        assert_eq!(b.received.lock()[0].redeliver_count(), 1);
        assert_eq!(fixture.stats().transient_failures, 1);
        assert!(fixture.dead.is_empty());
    }

    #[tokio::test]
    async fn test_filter_error_gives_up_without_delivery() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a").with_filter(Filter::Fail));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);
        let entry = fixture.publish();

        wait_until(|| fixture.stats().dead_lettered == 1).await;
        assert_eq!(a.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(b.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(a.internal_errors.load(Ordering::SeqCst), 1);

        let letters = fixture.dead.snapshot();
        assert_eq!(letters.len(), 1);
        assert!(letters[0].reason.contains("selector does not parse"));
        assert!(matches!(entry.return_value(), Some(ReturnValue::Failed { .. })));
        assert_eq!(fixture.store.num_entries(), 0);
    }

    #[tokio::test]
    async fn test_rejection_gives_up_without_trying_others() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a").with_steps(&[Step::Reject]));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);
        let entry = fixture.publish();

        wait_until(|| fixture.stats().dead_lettered == 1).await;
        assert_eq!(b.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(entry.redeliver_count(), 1);
        assert!(fixture.backlog.is_empty());
    }

    #[tokio::test]
    async fn test_consumer_panic_is_contained() {
        let fixture = Fixture::new(0);
        let consumer = Arc::new(MockConsumer::new("fragile").with_steps(&[Step::Panic]));
        fixture.add(&consumer);
        fixture.publish();

        wait_until(|| fixture.stats().dead_lettered == 1).await;
        assert!(fixture.dead.snapshot()[0].reason.contains("consumer exploded"));

        let next = fixture.publish();
        wait_until(|| fixture.stats().delivered == 1).await;
        assert_eq!(consumer.received_ids(), vec![next.unique_id().as_u64()]);
    }

    #[tokio::test]
    async fn test_no_taker_parks_until_consumer_added() {
        let fixture = Fixture::new(0);
        let picky = Arc::new(MockConsumer::new("picky").with_filter(Filter::Skip));
        fixture.add(&picky);
        fixture.publish();
        wait_until(|| fixture.is_parked()).await;

        // new entries do not wake a parked distributor
        fixture.publish();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(fixture.is_parked());
        assert_eq!(fixture.backlog.len(), 2);

        let willing = Arc::new(MockConsumer::new("willing"));
        fixture.add(&willing);
        wait_until(|| fixture.stats().delivered == 2).await;
        assert_eq!(willing.received_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_reachable_again_rearms() {
        let fixture = Fixture::new(0);
        let consumer = Arc::new(MockConsumer::new("flaky").unreachable());
        fixture.add(&consumer);
        fixture.publish();
        wait_until(|| fixture.is_parked()).await;
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 0);

        consumer.set_reachable(true);
        wait_until(|| fixture.stats().delivered == 1).await;
    }

    #[tokio::test]
    async fn test_redeliver_limit_dead_letters() {
        let fixture = Fixture::new(2);
        let consumer = Arc::new(MockConsumer::new("a").with_steps(&[Step::Transient; 5]));
        fixture.add(&consumer);
        let entry = fixture.publish();

        let settled = || fixture.is_parked() || fixture.stats().dead_lettered == 1;
        wait_until(settled).await;
        while fixture.stats().dead_lettered == 0 {
            fixture.distributor.on_consumer_reachability_changed(consumer.id(), true);
            wait_until(settled).await;
        }

        assert_eq!(entry.redeliver_count(), 2);
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 2);
        assert!(fixture.dead.snapshot()[0].reason.contains("redeliver limit of 2"));
        assert!(fixture.backlog.is_empty());
    }

    #[tokio::test]
    async fn test_single_worker_picks_up_late_entries() {
        let fixture = Fixture::new(0);
        let (open, gate) = watch::channel(false);
        let consumer = Arc::new(MockConsumer::new("slow").gated(gate));
        fixture.add(&consumer);
        fixture.publish();
        wait_until(|| consumer.attempts.load(Ordering::SeqCst) == 1).await;

        fixture.publish();
        fixture.publish();
        assert!(fixture.distributor.is_running());
        assert_eq!(fixture.stats().worker_runs, 1);

        open.send(true).unwrap();
        wait_until(|| fixture.stats().delivered == 3).await;
        wait_until(|| !fixture.distributor.is_running()).await;
        assert_eq!(fixture.stats().worker_runs, 1);
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_expired_entries_dropped() {
        let fixture = Fixture::new(0);
        let consumer = Arc::new(MockConsumer::new("c"));
        fixture.publish_entry(
            MessageEntry::builder("test").expires_at(Utc::now() - ChronoDuration::seconds(1)).build().unwrap(),
        );
        fixture.add(&consumer);

        wait_until(|| fixture.stats().expired == 1).await;
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 0);
        assert!(fixture.backlog.is_empty());
    }

    #[tokio::test]
    async fn test_removed_consumer_is_skipped() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a"));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);
        assert!(fixture.distributor.on_consumer_removed(a.id()).is_some());
        assert!(fixture.distributor.on_consumer_removed(a.id()).is_none());
        assert!(a.listeners.is_empty());

        fixture.publish();
        wait_until(|| fixture.stats().delivered == 1).await;
        assert_eq!(a.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(b.received_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_lost_consumer_leaves_ring() {
        let fixture = Fixture::new(0);
        let a = Arc::new(MockConsumer::new("a"));
        let b = Arc::new(MockConsumer::new("b"));
        fixture.add(&a);
        fixture.add(&b);

        a.listeners.notify_lost(a.id());
        assert_eq!(fixture.distributor.consumer_order(), vec![ConsumerId::new("b")]);
        assert!(a.listeners.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_stops_distribution() {
        let fixture = Fixture::new(0);
        let consumer = Arc::new(MockConsumer::new("c"));
        fixture.add(&consumer);
        assert_eq!(consumer.listeners.len(), 1);

        fixture.distributor.shutdown();
        assert!(fixture.distributor.is_shutdown());
        assert_eq!(fixture.distributor.consumer_count(), 0);
        assert!(consumer.listeners.is_empty());

        fixture.publish();
        consumer.set_reachable(true);
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(consumer.attempts.load(Ordering::SeqCst), 0);
        assert_eq!(fixture.backlog.len(), 1);

        fixture.distributor.on_consumer_added(Arc::clone(&consumer) as Arc<dyn Consumer>);
        assert_eq!(fixture.distributor.consumer_count(), 0);
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("static text");
        assert_eq!(panic_message(boxed.as_ref()), "static text");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("owned"));
        assert_eq!(panic_message(boxed.as_ref()), "owned");
        let boxed: Box<dyn Any + Send> = Box::new(7u8);
        assert_eq!(panic_message(boxed.as_ref()), "non-string panic payload");
    }
}
