//! Configuration schema definitions for courier
//!
//! All configuration structures use serde for (de)serialization and
//! validator for range checks. Defaults are applied section by section, so
//! a file only needs to name the values it changes.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

/// Root configuration object.
///
/// Layering: defaults → file → environment.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct CourierConfig {
    /// Message store limits
    #[validate(nested)]
    pub store: StoreSettings,

    /// Per-topic backlog limits
    #[validate(nested)]
    pub backlog: BacklogSettings,

    /// Distribution worker settings
    #[validate(nested)]
    pub dispatch: DispatchSettings,

    /// Logging output settings
    #[validate(nested)]
    pub logging: LoggingConfig,
}

impl CourierConfig {
    /// Run the range checks of every section.
    ///
    /// # Errors
    /// Returns [`Error::Configuration`](crate::Error::Configuration) naming
    /// the offending fields.
    pub fn ensure_valid(&self) -> crate::Result<()> {
        self.validate()?;
        Ok(())
    }
}

/// Capacity of the in-memory message store of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct StoreSettings {
    /// Maximum number of entries held in total
    #[validate(range(min = 1))]
    pub max_entries: u64,

    /// Maximum number of bytes held in total
    #[validate(range(min = 1))]
    pub max_bytes: u64,

    /// Entries kept in RAM before swapping to the spill store
    #[validate(range(min = 1))]
    pub max_entries_cache: u64,

    /// Bytes kept in RAM before swapping to the spill store
    #[validate(range(min = 1))]
    pub max_bytes_cache: u64,
}

impl Default for StoreSettings {
    fn default() -> Self {
        Self {
            max_entries: 1_000,
            max_bytes: 2 * 1024 * 1024,
            max_entries_cache: 1_000,
            max_bytes_cache: 2 * 1024 * 1024,
        }
    }
}

/// Capacity of one topic's backlog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct BacklogSettings {
    /// Maximum number of undelivered entries
    #[validate(range(min = 1))]
    pub max_entries: u64,
}

impl Default for BacklogSettings {
    fn default() -> Self {
        Self { max_entries: 10_000 }
    }
}

/// Distribution worker pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DispatchSettings {
    /// Upper bound of concurrently running distribution workers
    #[validate(range(min = 1, max = 1024))]
    pub max_workers: usize,

    /// Failed attempts after which an entry is dead-lettered; 0 = unlimited
    pub redeliver_limit: u32,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self { max_workers: 8, redeliver_limit: 0 }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, e.g. `info` or `courier_broker=debug`
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include the event target (module path)
    pub with_target: bool,

    /// Include thread ids
    pub with_thread_ids: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_target: true,
            with_thread_ids: false,
        }
    }
}

fn validate_log_level(level: &str) -> Result<(), ValidationError> {
    if level.trim().is_empty() {
        return Err(ValidationError::new("empty_log_level"));
    }
    Ok(())
}
