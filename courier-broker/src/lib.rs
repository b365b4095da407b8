//! # Courier Broker
//!
//! Consumable topics for the courier message broker. Every entry published
//! to a topic is handed to exactly one of its consumers, highest priority
//! first, with consumers taking turns.
//!
//! ## Examples
//!
//! ```rust
//! use courier_broker::{Broker, ChannelConsumer};
//! use courier_core::{CourierConfig, MessageEntry};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let broker = Broker::new(CourierConfig::default())?;
//! let (consumer, mut inbox) = ChannelConsumer::new("worker-1", 16);
//! broker.subscribe("orders", consumer)?;
//!
//! broker.publish(MessageEntry::builder("orders").with_payload("42").build()?)?;
//! let entry = inbox.recv().await.expect("delivered");
//! assert_eq!(entry.topic(), "orders");
//! broker.shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`broker`]: topic registry
//! - [`topic`]: store, backlog and distributor of one topic
//! - [`distributor`]: single-flight, round-robin distribution
//! - [`consumer`]: the capability a delivery target implements
//! - [`pool`]: bounded worker pool on the tokio runtime
//! - [`dead_letter`]: where given-up entries go

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod broker;
pub mod consumer;
pub mod dead_letter;
pub mod distributor;
pub mod error;
pub mod pool;
pub mod prelude;
pub mod topic;

pub use broker::{Broker, BrokerStats};
pub use consumer::{
    ChannelConsumer, Consumer, ConsumerId, DeliveryError, DeliveryMode, FilterError, ReachabilityListener,
    ReachabilityListeners,
};
pub use dead_letter::{DeadLetter, DeadLetterBuffer, DeadLetterSink, LoggingDeadLetterSink};
pub use distributor::{ConsumableDistributor, DistributorStats, DistributorStatsSnapshot};
pub use error::{BrokerError, BrokerResult};
pub use pool::DispatchPool;
pub use topic::{Topic, TopicStats};
