//! Sinks for entries that can never be delivered.

use chrono::{DateTime, Utc};
use courier_core::{MessageEntry, QueueEntry};
use parking_lot::Mutex;
use std::{
    collections::VecDeque,
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};
use tracing::{debug, warn};

/// Receives given-up entries.
pub trait DeadLetterSink: Send + Sync {
    /// Take ownership of `entries`, which failed for `reason`.
    fn dead_letter(&self, entries: &[Arc<MessageEntry>], reason: &str);
}

/// Writes every dead letter to the log at warn level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingDeadLetterSink;

impl DeadLetterSink for LoggingDeadLetterSink {
    fn dead_letter(&self, entries: &[Arc<MessageEntry>], reason: &str) {
        for entry in entries {
            warn!(
                topic = entry.topic(),
                entry = %entry.log_id(),
                sender = entry.sender(),
                redeliver_count = entry.redeliver_count(),
                reason,
                "Dead letter"
            );
        }
    }
}

/// A dead-lettered entry with its reason.
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// The entry
    pub entry: Arc<MessageEntry>,
    /// Why it was given up
    pub reason: String,
    /// When it was given up
    pub at: DateTime<Utc>,
}

/// Keeps the most recent dead letters in memory for operators.
///
/// Once `capacity` letters are held the oldest one is dropped for each new
/// one.
pub struct DeadLetterBuffer {
    capacity: usize,
    letters: Mutex<VecDeque<DeadLetter>>,
    dropped: AtomicU64,
}

impl DeadLetterBuffer {
    /// Create a buffer holding up to `capacity` letters (at least one)
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self { capacity, letters: Mutex::new(VecDeque::with_capacity(capacity)), dropped: AtomicU64::new(0) }
    }

    /// Letters currently held
    #[must_use]
    pub fn len(&self) -> usize {
        self.letters.lock().len()
    }

    /// Whether no letter is held
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.letters.lock().is_empty()
    }

    /// Letters pushed out by newer ones
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Copy of the held letters, oldest first
    #[must_use]
    pub fn snapshot(&self) -> Vec<DeadLetter> {
        self.letters.lock().iter().cloned().collect()
    }

    /// Remove and return the held letters, oldest first
    pub fn drain(&self) -> Vec<DeadLetter> {
        self.letters.lock().drain(..).collect()
    }
}

impl DeadLetterSink for DeadLetterBuffer {
    fn dead_letter(&self, entries: &[Arc<MessageEntry>], reason: &str) {
        let at = Utc::now();
        let mut letters = self.letters.lock();
        for entry in entries {
            if letters.len() == self.capacity {
                letters.pop_front();
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            debug!(entry = %entry.log_id(), reason, "Buffered dead letter");
            letters.push_back(DeadLetter { entry: Arc::clone(entry), reason: reason.to_string(), at });
        }
    }
}

impl fmt::Debug for DeadLetterBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeadLetterBuffer")
            .field("capacity", &self.capacity)
            .field("len", &self.len())
            .field("dropped", &self.dropped())
            .finish()
    }
}
