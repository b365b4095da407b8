//! Configuration management for courier
//!
//! - Schema-driven configuration with validation
//! - Multi-source loading (defaults, TOML file, `COURIER_*` environment)
//!
//! # Examples
//!
//! ```no_run
//! use courier_core::config::ConfigLoader;
//!
//! let config = ConfigLoader::new().load().expect("Failed to load configuration");
//! println!("store holds at most {} entries", config.store.max_entries);
//! ```

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::*;
