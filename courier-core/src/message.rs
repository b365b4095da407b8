//! Message entries and the clone-and-return result slot.

use crate::entry::{EntryId, MethodKind, Priority, QueueEntry};
use crate::{Error, Result};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering},
        Arc, OnceLock,
    },
};

/// Fixed bookkeeping overhead added to every size estimate.
const ENTRY_OVERHEAD_BYTES: u64 = 160;

/// Result value written back by whoever processed a dispatched entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ReturnValue {
    /// A consumer accepted the entry.
    Delivered {
        /// Consumer that took the entry
        consumer: String,
    },
    /// Delivery was given up.
    Failed {
        /// Why delivery was given up
        reason: String,
    },
    /// Arbitrary result payload.
    Data {
        /// The payload
        value: serde_json::Value,
    },
}

/// One-shot cell shared between an entry and its dispatch clones.
///
/// Only the first write is kept; later writes are ignored.
#[derive(Debug, Default)]
pub struct ReturnSlot {
    value: OnceLock<ReturnValue>,
}

impl ReturnSlot {
    /// Create an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the value. Returns `false` if the slot was already filled.
    pub fn set(&self, value: ReturnValue) -> bool {
        self.value.set(value).is_ok()
    }

    /// The value, if written.
    #[must_use]
    pub fn get(&self) -> Option<&ReturnValue> {
        self.value.get()
    }
}

/// A message waiting in a topic's store and backlog.
pub struct MessageEntry {
    id: EntryId,
    priority: Priority,
    persistent: bool,
    method: MethodKind,
    topic: String,
    sender: String,
    payload: Bytes,
    embedded_type: String,
    expires_at: Option<DateTime<Utc>>,
    size_in_bytes: AtomicU64,
    redeliver_count: AtomicU32,
    stored: AtomicBool,
    want_return_value: bool,
    return_slot: Arc<ReturnSlot>,
    /// Slot of the entry this one was cloned from; cleared after forwarding.
    clone_origin: Mutex<Option<Arc<ReturnSlot>>>,
}

impl MessageEntry {
    /// Start building a message entry for `topic`.
    #[must_use]
    pub fn builder(topic: impl Into<String>) -> MessageEntryBuilder {
        MessageEntryBuilder::new(topic)
    }

    /// Topic this entry was published to.
    #[must_use]
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Publisher session name.
    #[must_use]
    pub fn sender(&self) -> &str {
        &self.sender
    }

    /// Message content.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Serialization tag used by persistence collaborators.
    #[must_use]
    pub fn embedded_type(&self) -> &str {
        &self.embedded_type
    }

    /// Expiry instant, if any.
    #[must_use]
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.expires_at
    }

    /// Whether the entry has passed its expiry instant.
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }

    /// Whether a result value is expected back from dispatch.
    #[must_use]
    pub fn want_return_value(&self) -> bool {
        self.want_return_value
    }

    /// Set whether a result value is expected back from dispatch.
    pub fn set_want_return_value(&mut self, want: bool) {
        self.want_return_value = want;
    }

    /// Overwrite the size estimate. Stores pick the new value up through
    /// their `change` operation.
    pub fn set_size_in_bytes(&self, size: u64) {
        self.size_in_bytes.store(size, Ordering::Release);
    }

    /// Shallow copy for dispatch.
    ///
    /// The copy keeps the identity of this entry. If a return value is
    /// wanted, the copy holds a back-reference to this entry's slot and
    /// forwards the first value written into it.
    #[must_use]
    pub fn clone_for_dispatch(&self) -> Self {
        let origin = self.want_return_value.then(|| Arc::clone(&self.return_slot));
        Self {
            id: self.id,
            priority: self.priority,
            persistent: self.persistent,
            method: self.method,
            topic: self.topic.clone(),
            sender: self.sender.clone(),
            payload: self.payload.clone(),
            embedded_type: self.embedded_type.clone(),
            expires_at: self.expires_at,
            size_in_bytes: AtomicU64::new(self.size_in_bytes.load(Ordering::Acquire)),
            redeliver_count: AtomicU32::new(self.redeliver_count.load(Ordering::Acquire)),
            stored: AtomicBool::new(false),
            want_return_value: self.want_return_value,
            return_slot: Arc::new(ReturnSlot::new()),
            clone_origin: Mutex::new(origin),
        }
    }

    /// Record the result of processing this entry.
    ///
    /// On a dispatch clone the value is forwarded to the original exactly
    /// once and the back-reference is dropped.
    pub fn set_return_value(&self, value: ReturnValue) {
        let origin = self.clone_origin.lock().take();
        if let Some(origin) = origin {
            origin.set(value.clone());
        }
        self.return_slot.set(value);
    }

    /// The result value, if one was written.
    #[must_use]
    pub fn return_value(&self) -> Option<&ReturnValue> {
        self.return_slot.get()
    }

    /// Whether this instance still points back at an original.
    #[must_use]
    pub fn has_clone_origin(&self) -> bool {
        self.clone_origin.lock().is_some()
    }

    fn estimate_size(topic: &str, sender: &str, payload: &Bytes, embedded_type: &str) -> u64 {
        let variable = topic.len() + sender.len() + payload.len() + embedded_type.len();
        ENTRY_OVERHEAD_BYTES + variable as u64
    }
}

impl QueueEntry for MessageEntry {
    fn unique_id(&self) -> EntryId {
        self.id
    }

    fn priority(&self) -> Priority {
        self.priority
    }

    fn is_persistent(&self) -> bool {
        self.persistent
    }

    fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes.load(Ordering::Acquire)
    }

    fn method_kind(&self) -> MethodKind {
        self.method
    }

    fn set_stored(&self, stored: bool) {
        self.stored.store(stored, Ordering::Release);
    }

    fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }

    fn redeliver_count(&self) -> u32 {
        self.redeliver_count.load(Ordering::Acquire)
    }

    fn incr_redeliver_count(&self) {
        self.redeliver_count.fetch_add(1, Ordering::AcqRel);
    }
}

impl PartialEq for MessageEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.id == other.id
    }
}

impl Eq for MessageEntry {}

impl fmt::Debug for MessageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageEntry")
            .field("id", &self.id)
            .field("priority", &self.priority)
            .field("method", &self.method)
            .field("topic", &self.topic)
            .field("persistent", &self.persistent)
            .field("size_in_bytes", &self.size_in_bytes())
            .field("redeliver_count", &self.redeliver_count())
            .finish_non_exhaustive()
    }
}

/// Builder for [`MessageEntry`].
#[derive(Debug, Clone)]
pub struct MessageEntryBuilder {
    id: Option<EntryId>,
    topic: String,
    sender: String,
    payload: Bytes,
    priority: Priority,
    persistent: bool,
    method: MethodKind,
    embedded_type: String,
    expires_at: Option<DateTime<Utc>>,
    size_in_bytes: Option<u64>,
    want_return_value: bool,
}

impl MessageEntryBuilder {
    /// Create a builder with default settings for `topic`.
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            id: None,
            topic: topic.into(),
            sender: String::new(),
            payload: Bytes::new(),
            priority: Priority::NORM,
            persistent: false,
            method: MethodKind::Publish,
            embedded_type: "MSG_RAW".to_string(),
            expires_at: None,
            size_in_bytes: None,
            want_return_value: true,
        }
    }

    /// Reuse an existing identity instead of generating a new one.
    #[must_use]
    pub fn with_id(mut self, id: EntryId) -> Self {
        self.id = Some(id);
        self
    }

    /// Set the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Set the publisher session name.
    #[must_use]
    pub fn with_sender(mut self, sender: impl Into<String>) -> Self {
        self.sender = sender.into();
        self
    }

    /// Set the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Mark the entry persistent.
    #[must_use]
    pub fn persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    /// Set the method tag.
    #[must_use]
    pub fn with_method(mut self, method: MethodKind) -> Self {
        self.method = method;
        self
    }

    /// Set the serialization tag.
    #[must_use]
    pub fn with_embedded_type(mut self, embedded_type: impl Into<String>) -> Self {
        self.embedded_type = embedded_type.into();
        self
    }

    /// Expire the entry at `at`.
    #[must_use]
    pub fn expires_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    /// Override the size estimate.
    #[must_use]
    pub fn with_size_in_bytes(mut self, size: u64) -> Self {
        self.size_in_bytes = Some(size);
        self
    }

    /// Whether dispatch clones forward their result value.
    #[must_use]
    pub fn want_return_value(mut self, want: bool) -> Self {
        self.want_return_value = want;
        self
    }

    /// Build the entry.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if the topic name is empty.
    pub fn build(self) -> Result<MessageEntry> {
        if self.topic.trim().is_empty() {
            return Err(Error::invalid_argument("topic name cannot be empty"));
        }
        let size = self.size_in_bytes.unwrap_or_else(|| {
            MessageEntry::estimate_size(&self.topic, &self.sender, &self.payload, &self.embedded_type)
        });

        Ok(MessageEntry {
            id: self.id.unwrap_or_else(EntryId::generate),
            priority: self.priority,
            persistent: self.persistent,
            method: self.method,
            topic: self.topic,
            sender: self.sender,
            payload: self.payload,
            embedded_type: self.embedded_type,
            expires_at: self.expires_at,
            size_in_bytes: AtomicU64::new(size),
            redeliver_count: AtomicU32::new(0),
            stored: AtomicBool::new(false),
            want_return_value: self.want_return_value,
            return_slot: Arc::new(ReturnSlot::new()),
            clone_origin: Mutex::new(None),
        })
    }
}
