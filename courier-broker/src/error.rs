//! Broker error types.
//!
//! Store errors reach the publisher unchanged. Per-entry delivery errors
//! never travel back to a publisher; they end up in a dead letter and in
//! the consumer's `on_internal_error` callback.

use courier_storage::StorageError;
use thiserror::Error;

/// Broker operation result type alias
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Error enumeration for topic, distributor and broker operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Store or backlog refused the operation
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Entry model or configuration error
    #[error(transparent)]
    Core(#[from] courier_core::Error),

    /// Malformed request
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong
        message: String,
    },

    /// The topic or broker no longer accepts work
    #[error("'{name}' is shut down")]
    ShutDown {
        /// Topic or broker name
        name: String,
    },

    /// A consumer's content filter failed
    #[error("Filter of consumer '{consumer}' failed: {reason}")]
    Filter {
        /// Consumer whose filter failed
        consumer: String,
        /// Failure reported by the filter
        reason: String,
    },

    /// A consumer refused an entry for good
    #[error("Delivery to consumer '{consumer}' failed: {reason}")]
    Delivery {
        /// Consumer that failed
        consumer: String,
        /// Failure reported by the consumer
        reason: String,
    },

    /// A consumer panicked while taking an entry
    #[error("Consumer '{consumer}' panicked during delivery: {message}")]
    ConsumerPanic {
        /// Consumer that panicked
        consumer: String,
        /// Panic payload, if it was a string
        message: String,
    },

    /// An entry failed too often
    #[error("Entry exceeded the redeliver limit of {limit}")]
    RedeliverLimit {
        /// Configured limit
        limit: u32,
    },

    /// Invariant violation inside the broker
    #[error("Internal broker error: {message}")]
    Internal {
        /// Details about the anomaly
        message: String,
    },
}

impl BrokerError {
    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }

    /// Create an invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Whether the caller can retry later, e.g. after consumers drained the
    /// topic
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Storage(err) => err.is_recoverable(),
            Self::Core(courier_core::Error::ResourceExhausted { .. }) => true,
            _ => false,
        }
    }
}
