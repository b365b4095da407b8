//! # Prelude
//!
//! Commonly used types and traits of the courier core library.

pub use crate::{
    config::{ConfigLoader, CourierConfig},
    entry::{EntryId, EntryOrder, MethodKind, Priority, QueueEntry},
    error::{Error, Result},
    message::{MessageEntry, MessageEntryBuilder, ReturnValue},
};

pub use bytes::Bytes;
