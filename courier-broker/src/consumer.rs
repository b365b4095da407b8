//! Consumer capability seen by the distributor.
//!
//! A consumer is anything an entry can be handed to: a subscriber session,
//! an in-process callback, a bridge to another broker. The distributor only
//! needs reachability, an eligibility check, a content filter and a delivery
//! call.

use crate::error::BrokerError;
use async_trait::async_trait;
use courier_core::MessageEntry;
use parking_lot::Mutex;
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};
use thiserror::Error;
use tokio::{sync::mpsc, time::timeout};
use tracing::debug;

/// Consumer identity, e.g. a subscription id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(String);

impl ConsumerId {
    /// Create an id
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The id as text
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConsumerId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for ConsumerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// How a consumer wants entries handed over.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum DeliveryMode {
    /// The consumer takes ownership of the entry
    #[default]
    Exclusive,
    /// The consumer only peeks; not compatible with consumable topics
    DirtyRead,
}

/// Outcome of a failed delivery.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Transport-level trouble; another consumer may still take the entry
    #[error("communication failure: {reason}")]
    Communication {
        /// What went wrong
        reason: String,
    },
    /// The consumer refused the entry
    #[error("rejected: {reason}")]
    Rejected {
        /// Why the entry was refused
        reason: String,
    },
}

impl DeliveryError {
    /// Transient, consumer-scoped failure
    pub fn communication(reason: impl Into<String>) -> Self {
        Self::Communication { reason: reason.into() }
    }

    /// Permanent, entry-scoped failure
    pub fn rejected(reason: impl Into<String>) -> Self {
        Self::Rejected { reason: reason.into() }
    }

    /// Whether the distributor should try the next consumer
    #[must_use]
    pub fn is_communication(&self) -> bool {
        matches!(self, Self::Communication { .. })
    }
}

/// A content filter could not be evaluated.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("filter evaluation failed: {reason}")]
pub struct FilterError {
    /// What went wrong
    pub reason: String,
}

impl FilterError {
    /// Create a filter error
    pub fn new(reason: impl Into<String>) -> Self {
        Self { reason: reason.into() }
    }
}

/// Receives reachability changes of consumers.
pub trait ReachabilityListener: Send + Sync {
    /// The consumer became reachable (`true`) or unreachable (`false`).
    fn reachability_changed(&self, consumer: &ConsumerId, reachable: bool);

    /// The consumer is gone for good.
    fn consumer_lost(&self, _consumer: &ConsumerId) {}
}

/// A delivery target of a topic
#[async_trait]
pub trait Consumer: Send + Sync + fmt::Debug {
    /// Identity, unique within a topic
    fn id(&self) -> &ConsumerId;

    /// Whether deliveries can currently reach the consumer
    fn is_reachable(&self) -> bool;

    /// Domain check, e.g. the subscription's scope
    fn is_eligible(&self, _entry: &MessageEntry) -> bool {
        true
    }

    /// Hand-over mode
    fn delivery_mode(&self) -> DeliveryMode {
        DeliveryMode::Exclusive
    }

    /// Content filter. `Ok(false)` skips this consumer for the entry.
    ///
    /// # Errors
    /// An error gives up on the entry entirely.
    fn matches_filter(&self, _entry: &MessageEntry) -> Result<bool, FilterError> {
        Ok(true)
    }

    /// Take the entry. Network-bound consumers must apply their own timeout
    /// and report it as [`DeliveryError::Communication`].
    ///
    /// # Errors
    /// See [`DeliveryError`].
    async fn deliver(&self, entry: Arc<MessageEntry>) -> Result<(), DeliveryError>;

    /// The distributor gave up on an entry this consumer was involved with.
    fn on_internal_error(&self, _entry: &MessageEntry, _error: &BrokerError) {}

    /// Start reporting reachability changes to `listener`.
    fn add_reachability_listener(&self, _listener: Weak<dyn ReachabilityListener>) {}

    /// Stop reporting reachability changes to `listener`.
    fn remove_reachability_listener(&self, _listener: &Weak<dyn ReachabilityListener>) {}
}

/// Weakly held reachability listeners, for [`Consumer`] implementations.
#[derive(Default)]
pub struct ReachabilityListeners {
    listeners: Mutex<Vec<Weak<dyn ReachabilityListener>>>,
}

impl ReachabilityListeners {
    /// Create an empty set
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a listener unless already present
    pub fn add(&self, listener: Weak<dyn ReachabilityListener>) {
        let mut listeners = self.listeners.lock();
        if !listeners.iter().any(|known| Weak::ptr_eq(known, &listener)) {
            listeners.push(listener);
        }
    }

    /// Remove a listener
    pub fn remove(&self, listener: &Weak<dyn ReachabilityListener>) {
        self.listeners.lock().retain(|known| !Weak::ptr_eq(known, listener));
    }

    /// Number of listeners still alive
    #[must_use]
    pub fn len(&self) -> usize {
        self.listeners.lock().iter().filter(|l| l.strong_count() > 0).count()
    }

    /// Whether no live listener is registered
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Tell every live listener; dead ones are pruned.
    pub fn notify(&self, consumer: &ConsumerId, reachable: bool) {
        let alive: Vec<Arc<dyn ReachabilityListener>> = {
            let mut listeners = self.listeners.lock();
            listeners.retain(|l| l.strong_count() > 0);
            listeners.iter().filter_map(Weak::upgrade).collect()
        };
        for listener in alive {
            listener.reachability_changed(consumer, reachable);
        }
    }

    /// Tell every live listener the consumer is gone.
    pub fn notify_lost(&self, consumer: &ConsumerId) {
        let alive: Vec<Arc<dyn ReachabilityListener>> =
            self.listeners.lock().iter().filter_map(Weak::upgrade).collect();
        for listener in alive {
            listener.consumer_lost(consumer);
        }
    }
}

impl fmt::Debug for ReachabilityListeners {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReachabilityListeners").field("len", &self.len()).finish()
    }
}

/// How long [`ChannelConsumer::deliver`] waits for room in a full channel
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(1);

struct ChannelShared {
    id: ConsumerId,
    reachable: AtomicBool,
    /// Set while the channel stays full; cleared once a slot frees up.
    backpressured: AtomicBool,
    listeners: ReachabilityListeners,
}

impl ChannelShared {
    fn set_reachable(&self, reachable: bool) {
        if self.reachable.swap(reachable, Ordering::AcqRel) != reachable {
            debug!(consumer = %self.id, reachable, "Consumer reachability changed");
            self.listeners.notify(&self.id, reachable);
        }
    }

    fn closed(&self) {
        self.set_reachable(false);
        self.listeners.notify_lost(&self.id);
    }
}

/// In-process consumer forwarding entries into a bounded channel.
///
/// A delivery waits up to the send timeout for room in the channel. If the
/// channel stays full the delivery is a communication failure and the
/// consumer counts as unreachable until the receiver frees a slot, at which
/// point the listeners hear that it is reachable again. A closed channel
/// makes the consumer unreachable for good and reports it lost.
pub struct ChannelConsumer {
    sender: mpsc::Sender<Arc<MessageEntry>>,
    send_timeout: Duration,
    shared: Arc<ChannelShared>,
}

impl ChannelConsumer {
    /// Create a consumer and the receiving end of its channel
    #[must_use]
    pub fn new(
        id: impl Into<ConsumerId>,
        capacity: usize,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<MessageEntry>>) {
        Self::with_send_timeout(id, capacity, DEFAULT_SEND_TIMEOUT)
    }

    /// Like [`new`](Self::new) with a custom wait for room in a full
    /// channel. `Duration::ZERO` fails at once when the channel is full.
    #[must_use]
    pub fn with_send_timeout(
        id: impl Into<ConsumerId>,
        capacity: usize,
        send_timeout: Duration,
    ) -> (Arc<Self>, mpsc::Receiver<Arc<MessageEntry>>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let consumer = Arc::new(Self {
            sender,
            send_timeout,
            shared: Arc::new(ChannelShared {
                id: id.into(),
                reachable: AtomicBool::new(true),
                backpressured: AtomicBool::new(false),
                listeners: ReachabilityListeners::new(),
            }),
        });
        (consumer, receiver)
    }

    /// Flip reachability and tell the listeners if it changed
    pub fn set_reachable(&self, reachable: bool) {
        self.shared.set_reachable(reachable);
    }

    /// Whether the channel stayed full on the last delivery and has not
    /// drained since
    #[must_use]
    pub fn is_backpressured(&self) -> bool {
        self.shared.backpressured.load(Ordering::Acquire)
    }

    /// Mark the consumer full and wait in the background for a free slot.
    fn await_capacity(&self) {
        if self.shared.backpressured.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(consumer = %self.shared.id, "Channel full, waiting for the receiver");
        let sender = self.sender.clone();
        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            let freed = sender.reserve().await.is_ok();
            shared.backpressured.store(false, Ordering::Release);
            if !freed {
                shared.closed();
            } else if shared.reachable.load(Ordering::Acquire) {
                debug!(consumer = %shared.id, "Channel drained");
                shared.listeners.notify(&shared.id, true);
            }
        });
    }
}

#[async_trait]
impl Consumer for ChannelConsumer {
    fn id(&self) -> &ConsumerId {
        &self.shared.id
    }

    fn is_reachable(&self) -> bool {
        self.shared.reachable.load(Ordering::Acquire) && !self.is_backpressured() && !self.sender.is_closed()
    }

    async fn deliver(&self, entry: Arc<MessageEntry>) -> Result<(), DeliveryError> {
        match timeout(self.send_timeout, self.sender.send(entry)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => {
                self.shared.closed();
                Err(DeliveryError::communication("channel is closed"))
            },
            Err(_) => {
                self.await_capacity();
                Err(DeliveryError::communication("channel stayed full"))
            },
        }
    }

    fn add_reachability_listener(&self, listener: Weak<dyn ReachabilityListener>) {
        self.shared.listeners.add(listener);
    }

    fn remove_reachability_listener(&self, listener: &Weak<dyn ReachabilityListener>) {
        self.shared.listeners.remove(listener);
    }
}

impl fmt::Debug for ChannelConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelConsumer")
            .field("id", &self.shared.id)
            .field("reachable", &self.shared.reachable.load(Ordering::Relaxed))
            .field("backpressured", &self.is_backpressured())
            .field("capacity", &self.sender.max_capacity())
            .finish()
    }
}
