//! Error types for the courier core library.

use thiserror::Error;

/// Main error type for courier core operations.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Null, malformed or out-of-range input passed by a caller
    #[error("Invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong with the input
        message: String,
    },

    /// Capacity or byte limits exceeded
    #[error("Resource exhausted: {resource} ({current}/{limit})")]
    ResourceExhausted {
        /// Limited resource, e.g. `entries` or `bytes`
        resource: String,
        /// Amount in use
        current: u64,
        /// Configured limit
        limit: u64,
    },

    /// Configuration errors
    #[error("Configuration error: {message}")]
    Configuration {
        /// Offending setting and why
        message: String,
    },

    /// Serialization/deserialization errors
    #[error("Serialization error: {message}")]
    Serialization {
        /// Codec error text
        message: String,
    },

    /// Internal invariant violations
    #[error("Internal error: {message}")]
    Internal {
        /// Violated invariant
        message: String,
    },
}

/// Result type alias for courier operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Shorthand for an [`Error::InvalidArgument`].
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument { message: message.into() }
    }

    /// Shorthand for an [`Error::Configuration`].
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration { message: message.into() }
    }

    /// Shorthand for an [`Error::Internal`].
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<toml::de::Error> for Error {
    fn from(err: toml::de::Error) -> Self {
        Error::Configuration { message: err.to_string() }
    }
}

impl From<toml::ser::Error> for Error {
    fn from(err: toml::ser::Error) -> Self {
        Error::Serialization { message: err.to_string() }
    }
}

impl From<validator::ValidationErrors> for Error {
    fn from(err: validator::ValidationErrors) -> Self {
        Error::Configuration { message: format!("Validation failed: {err}") }
    }
}
