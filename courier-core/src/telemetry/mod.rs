//! Observability for courier: structured logging through `tracing`.

pub mod logging;

pub use logging::{init_logging, try_init_logging};
