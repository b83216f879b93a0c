//! The broker channel boundary.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;

use crate::config::{ExchangeConfig, QueueConfig};
use crate::error::MessagingError;
use crate::message::{ConsumeOptions, Delivery, OutboundMessage, QueueStatus};

/// A consumer's deliveries. Ends when the consumer is cancelled or the channel closes.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<Delivery, MessagingError>> + Send>>;

/// Trait for message broker channels.
///
/// A channel is shared by everything publishing and consuming through one bus;
/// only its owner calls [`close`](BrokerChannel::close).
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare an exchange. Declaring an existing exchange is a no-op.
    async fn declare_exchange(&self, config: &ExchangeConfig) -> Result<(), MessagingError>;

    /// Declare a queue with its retry and dead-letter policy.
    async fn declare_queue(&self, config: &QueueConfig) -> Result<(), MessagingError>;

    /// Bind a queue to an exchange.
    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Remove a binding created by [`bind_queue`](BrokerChannel::bind_queue).
    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError>;

    /// Publish a message. Delivery is confirmed by
    /// [`wait_for_confirms`](BrokerChannel::wait_for_confirms).
    async fn publish(&self, message: &OutboundMessage) -> Result<(), MessagingError>;

    /// Wait until the broker confirms every message published so far.
    async fn wait_for_confirms(&self) -> Result<(), MessagingError>;

    /// Start consuming messages from a queue.
    async fn consume(&self, options: ConsumeOptions) -> Result<MessageStream, MessagingError>;

    /// Stop a consumer started by [`consume`](BrokerChannel::consume).
    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError>;

    /// Acknowledge a delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError>;

    /// Negatively acknowledge a delivery. Without `requeue` the queue's
    /// retry and dead-letter policy applies.
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError>;

    /// Current depth and consumer count of a queue.
    async fn queue_status(&self, queue: &str) -> Result<QueueStatus, MessagingError>;

    /// Whether an exchange has been declared.
    async fn exchange_exists(&self, exchange: &str) -> Result<bool, MessagingError>;

    /// Whether the channel can still be used.
    fn is_connected(&self) -> bool;

    /// Close the channel gracefully.
    async fn close(&self) -> Result<(), MessagingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Verify the trait is object-safe
    fn _assert_object_safe(_: &dyn BrokerChannel) {}
}
