//! Error types for messaging operations

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur during broker operations
#[derive(Error, Debug)]
pub enum MessagingError {
    /// Failed to connect to the broker, or the connection was lost
    #[error("Connection failed: {0}")]
    Connection(String),

    /// Failed to publish a message
    #[error("Publish failed: {0}")]
    Publish(String),

    /// The broker did not confirm (or negatively confirmed) published messages
    #[error("Publisher confirm failed: {0}")]
    Confirm(String),

    /// Failed to start or cancel a consumer
    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    /// Failed to acknowledge a delivery
    #[error("Acknowledge failed: {0}")]
    Acknowledge(String),

    /// Failed to serialize a message
    #[error("Serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize a message
    #[error("Deserialization failed: {0}")]
    Deserialization(String),

    /// Operation timed out
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Configuration(String),

    /// Channel/connection is closed
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Queue or exchange not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource exhausted (e.g., too many channels)
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Internal broker error
    #[error("Broker error: {0}")]
    BrokerError(String),
}

impl MessagingError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_)
                | MessagingError::Confirm(_)
                | MessagingError::Timeout(_)
                | MessagingError::ChannelClosed(_)
                | MessagingError::ResourceExhausted(_)
                | MessagingError::BrokerError(_)
        )
    }

    /// Check if this error indicates a connection issue
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            MessagingError::Connection(_) | MessagingError::ChannelClosed(_)
        )
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, MessagingError::Timeout(_))
    }
}

#[cfg(feature = "rabbitmq")]
impl From<lapin::Error> for MessagingError {
    fn from(err: lapin::Error) -> Self {
        match &err {
            lapin::Error::IOError(_) => MessagingError::Connection(err.to_string()),
            lapin::Error::ChannelsLimitReached => {
                MessagingError::ResourceExhausted(err.to_string())
            }
            lapin::Error::InvalidChannelState(_) => MessagingError::ChannelClosed(err.to_string()),
            lapin::Error::InvalidConnectionState(_) => MessagingError::Connection(err.to_string()),
            _ => MessagingError::BrokerError(err.to_string()),
        }
    }
}

/// Errors returned by [`BatchPublisher`](crate::BatchPublisher).
#[derive(Error, Debug)]
pub enum BatchError {
    /// `max_buffer` items are already waiting to be flushed
    #[error("batch buffer full: {pending} items pending (limit {limit})")]
    BufferFull { pending: usize, limit: usize },

    /// The publisher was closed
    #[error("batch publisher is closed")]
    Closed,

    /// Every retry of the batch failed; the batch was dropped
    #[error("batch {batch_id} of {items} items dropped after {attempts} attempts: {source}")]
    Dropped {
        batch_id: String,
        items: usize,
        attempts: u32,
        #[source]
        source: MessagingError,
    },

    /// The flush failed and the items were put back at the head of the buffer
    #[error("batch flush failed, {items} items kept for the next flush: {source}")]
    Requeued {
        items: usize,
        #[source]
        source: MessagingError,
    },
}

impl BatchError {
    /// The broker error behind a failed flush, if any.
    pub fn broker_error(&self) -> Option<&MessagingError> {
        match self {
            BatchError::Dropped { source, .. } | BatchError::Requeued { source, .. } => {
                Some(source)
            }
            _ => None,
        }
    }
}
