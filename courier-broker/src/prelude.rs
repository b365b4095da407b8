//! Commonly used broker types, plus the core prelude.

pub use crate::{
    broker::Broker,
    consumer::{ChannelConsumer, Consumer, ConsumerId, DeliveryError, DeliveryMode, FilterError},
    dead_letter::{DeadLetterBuffer, DeadLetterSink},
    error::{BrokerError, BrokerResult},
    topic::Topic,
};
pub use async_trait::async_trait;
pub use courier_core::prelude::*;
