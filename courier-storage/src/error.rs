//! Storage error types and error handling utilities.
//!
//! Capacity overflow is the one error callers are expected to react to
//! (backpressure, larger limits). Everything else is either a caller bug or
//! an invariant violation worth flagging to operators.

use std::fmt;
use thiserror::Error;

/// Storage operation result type alias
pub type StorageResult<T> = Result<T, StorageError>;

/// Error enumeration for store, backlog and cache operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// Entry or byte limit reached
    #[error("Resource exhausted in '{storage_id}': {resource} limit exceeded ({current}/{limit})")]
    ResourceExhausted {
        /// Storage that refused the insert
        storage_id: String,
        /// Which limit was hit (`entries` or `bytes`)
        resource: String,
        /// Current usage
        current: u64,
        /// Configured limit
        limit: u64,
    },

    /// Malformed input or use of a shut down storage
    #[error("Invalid argument for '{storage_id}': {reason}")]
    InvalidArgument {
        /// Storage the call was made on
        storage_id: String,
        /// What was wrong with the call
        reason: String,
    },

    /// Invariant violation inside a storage
    #[error("Internal storage error in '{storage_id}': {reason}")]
    Internal {
        /// Storage where the anomaly was detected
        storage_id: String,
        /// Details about the anomaly
        reason: String,
    },

    /// Configuration error
    #[error("Configuration error: {parameter} = {value} is invalid: {reason}")]
    ConfigurationError {
        /// Configuration parameter with invalid value
        parameter: String,
        /// The rejected value
        value: String,
        /// Reason why the configuration is invalid
        reason: String,
    },

    /// The spill (persistence) collaborator failed or is unavailable
    #[error("Spill store unavailable for '{storage_id}': {reason}")]
    SpillUnavailable {
        /// Storage that tried to swap
        storage_id: String,
        /// Failure reported by the collaborator
        reason: String,
    },
}

impl StorageError {
    /// Capacity overflow with context.
    pub fn exhausted(storage_id: impl Into<String>, resource: &str, current: u64, limit: u64) -> Self {
        Self::ResourceExhausted {
            storage_id: storage_id.into(),
            resource: resource.to_string(),
            current,
            limit,
        }
    }

    /// Caller error with context.
    pub fn invalid_argument(storage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArgument { storage_id: storage_id.into(), reason: reason.into() }
    }

    /// Invariant violation with context.
    pub fn internal(storage_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Internal { storage_id: storage_id.into(), reason: reason.into() }
    }

    /// Check if the caller can recover by retrying later or shedding load
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ResourceExhausted { .. } | Self::SpillUnavailable { .. })
    }

    /// Get error severity level
    #[must_use]
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Internal { .. } => ErrorSeverity::Critical,
            Self::SpillUnavailable { .. } | Self::ConfigurationError { .. } => ErrorSeverity::High,
            Self::ResourceExhausted { .. } => ErrorSeverity::Medium,
            Self::InvalidArgument { .. } => ErrorSeverity::Low,
        }
    }
}

impl From<StorageError> for courier_core::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ResourceExhausted { resource, current, limit, .. } => {
                Self::ResourceExhausted { resource, current, limit }
            },
            StorageError::InvalidArgument { reason, .. } => Self::InvalidArgument { message: reason },
            StorageError::ConfigurationError { parameter, value, reason } => Self::Configuration {
                message: format!("{parameter} = {value}: {reason}"),
            },
            other => Self::Internal { message: other.to_string() },
        }
    }
}

/// Error severity classification for logging and monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    /// Caller mistake, nothing wrong with the storage
    Low,
    /// Expected under load
    Medium,
    /// Needs operator attention
    High,
    /// Invariant violated
    Critical,
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}
