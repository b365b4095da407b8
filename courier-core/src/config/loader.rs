//! # Configuration Loading
//!
//! Loads configuration from defaults, a TOML file and environment variables,
//! in that order, and validates the result.

use crate::{config::schema::CourierConfig, Error, Result};
use std::{
    collections::HashMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};
use validator::Validate;

/// File names probed in every search path, first match wins.
const CONFIG_FILE_NAMES: [&str; 2] = ["courier.toml", "config.toml"];

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    env_prefix: String,
    env_overrides: Option<HashMap<String, String>>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    #[must_use]
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("courier"));
        }
        Self { search_paths, env_prefix: "COURIER".to_string(), env_overrides: None }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Replace the search paths
    #[must_use]
    pub fn with_search_paths(mut self, paths: Vec<PathBuf>) -> Self {
        self.search_paths = paths;
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Use the given variables instead of the process environment
    #[must_use]
    pub fn with_env_vars(mut self, vars: HashMap<String, String>) -> Self {
        self.env_overrides = Some(vars);
        self
    }

    /// Load configuration from all available sources
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] if a file cannot be read or parsed,
    /// an override does not fit the schema, or validation fails.
    pub fn load(&self) -> Result<CourierConfig> {
        let mut config_value = toml::Value::try_from(CourierConfig::default())?;
        debug!("Applied default configuration");

        if let Some(config_path) = self.find_config_file() {
            let file_config = Self::read_file(&config_path)?;
            config_value = Self::merge(config_value, file_config);
            info!(path = %config_path.display(), "Loaded configuration file");
        } else {
            debug!("No configuration file found in search paths");
        }

        self.apply_env_vars(&mut config_value);

        let config: CourierConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;
        config.validate()?;

        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, without environment overrides
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on read, parse or validation failure.
    pub fn load_from_file<P: AsRef<Path>>(&self, path: P) -> Result<CourierConfig> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration from file");
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        Self::load_from_str(&content)
    }

    /// Parse and validate a TOML document
    ///
    /// # Errors
    /// Returns [`Error::Configuration`] on parse or validation failure.
    pub fn load_from_str(content: &str) -> Result<CourierConfig> {
        let config: CourierConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    ///
    /// # Errors
    /// Returns an error if serialization or the write fails.
    pub fn save_to_file<P: AsRef<Path>>(config: &CourierConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)?;
        std::fs::write(path.as_ref(), toml_string).map_err(|e| {
            Error::configuration(format!(
                "Failed to write config to {}: {e}",
                path.as_ref().display()
            ))
        })?;
        info!(path = %path.as_ref().display(), "Configuration saved");
        Ok(())
    }

    /// Get the effective search paths being used
    #[must_use]
    pub fn search_paths(&self) -> &[PathBuf] {
        &self.search_paths
    }

    /// Get the environment prefix being used
    #[must_use]
    pub fn env_prefix(&self) -> &str {
        &self.env_prefix
    }

    fn find_config_file(&self) -> Option<PathBuf> {
        self.search_paths
            .iter()
            .flat_map(|dir| CONFIG_FILE_NAMES.iter().map(move |name| dir.join(name)))
            .find(|candidate| candidate.is_file())
    }

    fn read_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;
        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    fn merge(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
            (&mut base, override_value)
        {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        *existing = Self::merge(existing.clone(), value);
                    },
                    Some(existing) => *existing = value,
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        }
        base
    }

    /// `COURIER_STORE_MAX_ENTRIES=5` sets `store.max_entries = 5`: the first
    /// segment after the prefix names the section, the rest the key.
    fn apply_env_vars(&self, config: &mut toml::Value) {
        let prefix = format!("{}_", self.env_prefix);
        let vars: Vec<(String, String)> = match &self.env_overrides {
            Some(vars) => vars.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            None => env::vars().collect(),
        };

        let mut applied = 0usize;
        for (key, value) in vars {
            let Some(rest) = key.strip_prefix(&prefix) else { continue };
            let rest = rest.to_lowercase();
            let Some((section, field)) = rest.split_once('_') else { continue };
            if let toml::Value::Table(root) = config {
                let entry = root
                    .entry(section.to_string())
                    .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
                if let toml::Value::Table(table) = entry {
                    table.insert(field.to_string(), Self::parse_env_value(&value));
                    applied += 1;
                }
            }
        }
        debug!(applied, "Applied environment overrides");
    }

    /// Parse environment variable value to appropriate TOML type
    fn parse_env_value(value: &str) -> toml::Value {
        if let Ok(bool_val) = value.parse::<bool>() {
            return toml::Value::Boolean(bool_val);
        }
        if let Ok(int_val) = value.parse::<i64>() {
            return toml::Value::Integer(int_val);
        }
        if let Ok(float_val) = value.parse::<f64>() {
            return toml::Value::Float(float_val);
        }
        toml::Value::String(value.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::LogFormat;
    use tempfile::TempDir;

    fn isolated_loader(dir: &TempDir) -> ConfigLoader {
        ConfigLoader::new()
            .with_search_paths(vec![dir.path().to_path_buf()])
            .with_env_vars(HashMap::new())
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = isolated_loader(&dir).load().unwrap();
        assert_eq!(config, CourierConfig::default());
    }

    #[test]
    fn test_file_then_env_layering() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("courier.toml"),
            "[store]\nmax_entries = 50\nmax_bytes = 4096\n\n[logging]\nformat = \"json\"\n",
        )
        .unwrap();

        let mut vars = HashMap::new();
        vars.insert("COURIER_STORE_MAX_ENTRIES".to_string(), "7".to_string());
        vars.insert("COURIER_DISPATCH_MAX_WORKERS".to_string(), "3".to_string());
        vars.insert("UNRELATED_STORE_MAX_ENTRIES".to_string(), "1".to_string());

        let config = isolated_loader(&dir).with_env_vars(vars).load().unwrap();
        assert_eq!(config.store.max_entries, 7);
        assert_eq!(config.store.max_bytes, 4096);
        assert_eq!(config.dispatch.max_workers, 3);
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_invalid_override_fails_validation() {
        let dir = TempDir::new().unwrap();
        let mut vars = HashMap::new();
        vars.insert("COURIER_DISPATCH_MAX_WORKERS".to_string(), "0".to_string());
        let result = isolated_loader(&dir).with_env_vars(vars).load();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("saved.toml");
        let mut config = CourierConfig::default();
        config.backlog.max_entries = 12;
        config.dispatch.redeliver_limit = 4;

        ConfigLoader::save_to_file(&config, &path).unwrap();
        let reloaded = ConfigLoader::new().load_from_file(&path).unwrap();
        assert_eq!(reloaded, config);
    }

    #[test]
    fn test_malformed_file_is_configuration_error() {
        let result = ConfigLoader::load_from_str("[store\nmax_entries = ");
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }
}
