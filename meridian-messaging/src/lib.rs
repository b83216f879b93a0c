//! # Meridian Messaging
//!
//! Broker plumbing for the Meridian event bus.
//!
//! - [`BrokerChannel`] - the channel boundary every backend implements
//! - [`MemoryBroker`] - an in-process broker with topic routing, retry and
//!   dead-letter queues, used by tests and single-process deployments
//! - [`BatchPublisher`] - buffers messages and publishes them in confirmed batches
//!
//! ## Features
//!
//! - `rabbitmq` - RabbitMQ/AMQP backend over `lapin`
//!
//! ## Example
//!
//! ```rust
//! use std::sync::Arc;
//! use meridian_messaging::*;
//!
//! # tokio_test::block_on(async {
//! let broker = MemoryBroker::new();
//! let channel: Arc<dyn BrokerChannel> = Arc::new(broker.channel());
//! channel.declare_exchange(&ExchangeConfig::topic("events")).await?;
//!
//! let publisher = BatchPublisher::new(channel, BatchConfig::new("events").batch_size(50))?;
//! publisher.add(BatchItem::new("PING", b"{}".to_vec())).await?;
//! assert_eq!(publisher.close().await?, 1);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # }).unwrap();
//! ```

mod batch;
mod config;
mod error;
mod memory;
mod message;
mod traits;

#[cfg(feature = "rabbitmq")]
pub mod rabbitmq;

pub use batch::{
    BatchConfig, BatchItem, BatchPublisher, BatchRetryPolicy, BatchStats, DroppedBatchHook,
};
pub use config::{ExchangeConfig, ExchangeKind, MessagingConfig, QueueConfig};
pub use error::{BatchError, MessagingError};
pub use memory::{MemoryBroker, MemoryChannel, topic_matches};
pub use message::{
    BATCH_ID_HEADER, BATCH_SIZE_HEADER, ConsumeOptions, DEATH_QUEUE_HEADER, Delivery,
    OutboundMessage, QueueStatus, RETRY_COUNT_HEADER,
};
pub use traits::{BrokerChannel, MessageStream};

/// Prelude for common imports.
pub mod prelude {
    pub use crate::batch::{BatchConfig, BatchItem, BatchPublisher};
    pub use crate::config::{ExchangeConfig, MessagingConfig, QueueConfig};
    pub use crate::error::{BatchError, MessagingError};
    pub use crate::memory::MemoryBroker;
    pub use crate::message::{ConsumeOptions, Delivery, OutboundMessage};
    pub use crate::traits::BrokerChannel;
}
