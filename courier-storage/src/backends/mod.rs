//! Storage backend implementations
//!
//! Only the in-memory backend lives here. Durable backends plug in through
//! [`SpillStore`](crate::traits::SpillStore).

pub mod memory;
