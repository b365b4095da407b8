//! Backend-independent entry model and the ordering contract.
//!
//! Every unit of work flowing through a store or backlog implements
//! [`QueueEntry`]. Ordering between entries is defined once, by
//! [`EntryOrder`]: higher priority first, then older (smaller id) first.

use crate::{timestamp::UniqueTimestamp, Error, Result};
use serde::{Deserialize, Serialize};
use std::{cmp::Ordering, fmt, str::FromStr};

/// Unique entry identity, the nanosecond creation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntryId(u64);

impl EntryId {
    /// Generate a new, process-wide unique id.
    #[must_use]
    pub fn generate() -> Self {
        Self(UniqueTimestamp::next())
    }

    /// Wrap a raw timestamp, e.g. one reloaded from a persistence backend.
    #[must_use]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// The raw nanosecond value.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for EntryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Entry priority in the range 0 (lowest) to 9 (highest).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority.
    pub const MIN: Self = Self(0);
    /// Low priority.
    pub const LOW: Self = Self(3);
    /// Default priority.
    pub const NORM: Self = Self(5);
    /// High priority.
    pub const HIGH: Self = Self(7);
    /// Highest priority.
    pub const MAX: Self = Self(9);

    /// Create a priority.
    ///
    /// # Errors
    /// Returns [`Error::InvalidArgument`] if `value` is greater than 9.
    pub fn new(value: u8) -> Result<Self> {
        if value > Self::MAX.0 {
            return Err(Error::invalid_argument(format!(
                "priority {value} is out of range 0..=9"
            )));
        }
        Ok(Self(value))
    }

    /// The numeric value.
    #[must_use]
    pub const fn value(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::NORM
    }
}

impl TryFrom<u8> for Priority {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(priority: Priority) -> Self {
        priority.0
    }
}

impl FromStr for Priority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "MIN" => Ok(Self::MIN),
            "LOW" => Ok(Self::LOW),
            "NORM" => Ok(Self::NORM),
            "HIGH" => Ok(Self::HIGH),
            "MAX" => Ok(Self::MAX),
            other => other
                .parse::<u8>()
                .map_err(|_| Error::invalid_argument(format!("unknown priority '{s}'")))
                .and_then(Self::new),
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of operation an entry represents. Opaque to stores and
/// distributors; only used for dispatch-type routing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MethodKind {
    /// Message published by a producer
    Publish,
    /// Message on its way to a subscriber
    Update,
    /// Subscription request
    Subscribe,
    /// Subscription removal
    Unsubscribe,
    /// Topic erase request
    Erase,
    /// Synchronous read request
    Get,
    /// Liveness probe
    Ping,
    /// Session login
    Connect,
    /// Session logout
    Disconnect,
}

impl fmt::Display for MethodKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Publish => "publish",
            Self::Update => "update",
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
            Self::Erase => "erase",
            Self::Get => "get",
            Self::Ping => "ping",
            Self::Connect => "connect",
            Self::Disconnect => "disconnect",
        };
        f.write_str(name)
    }
}

/// Sort key giving the total order of entries in any backlog.
///
/// Higher priority sorts first; within one priority the smaller (older) id
/// sorts first. Two keys are equal exactly when priority and id are equal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryOrder {
    /// Entry priority
    pub priority: Priority,
    /// Entry identity
    pub id: EntryId,
}

impl EntryOrder {
    /// Build the sort key.
    #[must_use]
    pub const fn new(priority: Priority, id: EntryId) -> Self {
        Self { priority, id }
    }
}

impl Ord for EntryOrder {
    fn cmp(&self, other: &Self) -> Ordering {
        other.priority.cmp(&self.priority).then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for EntryOrder {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Storage-facing view of a unit of work.
///
/// Identity fields (`unique_id`, `priority`, `is_persistent`) must not change
/// while an entry is held by a store. The `stored` flag and the redeliver
/// counter are interior-mutable so entries can be shared behind `Arc`.
pub trait QueueEntry: Send + Sync + fmt::Debug {
    /// Unique identity, also the age tie-break.
    fn unique_id(&self) -> EntryId;

    /// Priority, 0..=9.
    fn priority(&self) -> Priority;

    /// Whether the entry must survive a restart.
    fn is_persistent(&self) -> bool;

    /// Approximate memory footprint used for store accounting.
    fn size_in_bytes(&self) -> u64;

    /// Operation tag.
    fn method_kind(&self) -> MethodKind;

    /// Mark the entry as held (or no longer held) by a store.
    fn set_stored(&self, stored: bool);

    /// Whether a store currently holds the entry.
    fn is_stored(&self) -> bool;

    /// Failed delivery attempts so far. Advisory: not guaranteed to survive
    /// a restart.
    fn redeliver_count(&self) -> u32;

    /// Count one more failed delivery attempt.
    fn incr_redeliver_count(&self);

    /// The backlog sort key.
    fn sort_key(&self) -> EntryOrder {
        EntryOrder::new(self.priority(), self.unique_id())
    }

    /// Short identifier for log lines.
    fn log_id(&self) -> String {
        format!("{}/{}/prio={}", self.method_kind(), self.unique_id(), self.priority())
    }
}
