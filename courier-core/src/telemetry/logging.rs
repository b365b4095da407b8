//! Logging setup
//!
//! Installs a `tracing-subscriber` fmt subscriber configured from
//! [`LoggingConfig`]. `RUST_LOG` takes precedence over the configured level.

use crate::config::{LogFormat, LoggingConfig};
use crate::{Error, Result};
use tracing_subscriber::{fmt, EnvFilter};

/// Build the filter: `RUST_LOG` if set and valid, the configured level otherwise.
fn build_filter(config: &LoggingConfig) -> Result<EnvFilter> {
    if let Ok(filter) = EnvFilter::try_from_default_env() {
        return Ok(filter);
    }
    EnvFilter::try_new(&config.level)
        .map_err(|e| Error::configuration(format!("Invalid log level '{}': {e}", config.level)))
}

/// Returns `false` if another global subscriber was already installed.
fn install(config: &LoggingConfig) -> Result<bool> {
    let filter = build_filter(config)?;
    let builder = fmt()
        .with_env_filter(filter)
        .with_target(config.with_target)
        .with_thread_ids(config.with_thread_ids);

    let installed = match config.format {
        LogFormat::Text => builder.try_init(),
        LogFormat::Json => builder.json().try_init(),
    };
    Ok(installed.is_ok())
}

/// Install the global subscriber.
///
/// # Errors
/// Returns [`Error::Configuration`] if the level directive cannot be parsed
/// or a global subscriber is already installed.
pub fn try_init_logging(config: &LoggingConfig) -> Result<()> {
    if install(config)? {
        Ok(())
    } else {
        Err(Error::configuration("a global tracing subscriber is already installed"))
    }
}

/// Install the global subscriber, keeping an already installed one.
///
/// Safe to call from every test.
///
/// # Errors
/// Returns [`Error::Configuration`] if the level directive cannot be parsed.
pub fn init_logging(config: &LoggingConfig) -> Result<()> {
    install(config).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).is_ok());
    }

    #[test]
    fn test_bad_directive_rejected() {
        let config = LoggingConfig { level: "courier_core=loudest".to_string(), ..LoggingConfig::default() };
        if std::env::var("RUST_LOG").is_err() {
            assert!(matches!(build_filter(&config), Err(Error::Configuration { .. })));
        }
    }
}
