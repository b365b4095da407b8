//! # Courier Core
//!
//! Foundational types for the courier message broker: the entry model and
//! its ordering contract, configuration loading and logging setup.
//!
//! ## Quick Start
//!
//! ```rust
//! use courier_core::{MessageEntry, Priority, QueueEntry};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let entry = MessageEntry::builder("sensor.temperature")
//!     .with_sender("client/joe/1")
//!     .with_priority(Priority::HIGH)
//!     .with_payload("21.5")
//!     .build()?;
//!
//! assert_eq!(entry.priority(), Priority::HIGH);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`entry`]: identities, priorities and the [`QueueEntry`] trait
//! - [`message`]: [`MessageEntry`] and the clone-and-return slot
//! - [`timestamp`]: unique nanosecond timestamps
//! - [`config`]: configuration schema and loader
//! - [`telemetry`]: logging setup
//! - [`error`]: error types and result handling

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod entry;
pub mod error;
pub mod message;
pub mod prelude;
pub mod telemetry;
pub mod timestamp;

pub use crate::{
    config::CourierConfig,
    entry::{EntryId, EntryOrder, MethodKind, Priority, QueueEntry},
    error::{Error, Result},
    message::{MessageEntry, MessageEntryBuilder, ReturnSlot, ReturnValue},
    timestamp::UniqueTimestamp,
};
