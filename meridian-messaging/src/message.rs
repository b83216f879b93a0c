//! Message types crossing the broker boundary.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::error::MessagingError;

/// Header carrying the id shared by every message of one flushed batch.
pub const BATCH_ID_HEADER: &str = "x-batch-id";
/// Header carrying the number of messages in the batch.
pub const BATCH_SIZE_HEADER: &str = "x-batch-size";
/// Header carrying how many times the broker has redelivered a message after rejection.
pub const RETRY_COUNT_HEADER: &str = "x-retry-count";
/// Header naming the queue a dead-lettered message was rejected from.
pub const DEATH_QUEUE_HEADER: &str = "x-death-queue";

/// A message to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    /// Target exchange; `""` routes straight to the queue named by the routing key
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    /// Survive a broker restart
    pub persistent: bool,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    /// Create a new persistent message
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body: body.into(),
            headers: HashMap::new(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            content_type: None,
            persistent: true,
            timestamp: Utc::now(),
        }
    }

    /// Create a message from a JSON-serializable value
    pub fn json<T: Serialize>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        value: &T,
    ) -> Result<Self, MessagingError> {
        let body =
            serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))?;
        Ok(Self::new(exchange, routing_key, body).with_content_type("application/json"))
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Set the correlation ID
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the content type
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Set as non-persistent
    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

impl fmt::Display for OutboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Message {{ id: {}, exchange: {}, routing_key: {}, size: {} bytes }}",
            self.message_id,
            self.exchange,
            self.routing_key,
            self.body.len()
        )
    }
}

/// A message received from a queue, awaiting acknowledgment
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Tag to pass to `ack`/`nack` on the channel that delivered it
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

impl Delivery {
    /// Parse the body as JSON
    pub fn parse_json<T: DeserializeOwned>(&self) -> Result<T, MessagingError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| MessagingError::Deserialization(e.to_string()))
    }

    /// Get the body as a UTF-8 string
    pub fn body_str(&self) -> Result<&str, MessagingError> {
        std::str::from_utf8(&self.body).map_err(|e| MessagingError::Deserialization(e.to_string()))
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Broker-side redeliveries after rejection so far.
    pub fn retry_count(&self) -> u32 {
        self.header(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

/// Options for consuming messages
#[derive(Debug, Clone)]
pub struct ConsumeOptions {
    pub queue: String,
    /// Identifies the consumer for `cancel`
    pub consumer_tag: String,
    /// Deliveries held unacknowledged at once
    pub prefetch: Option<u16>,
}

impl ConsumeOptions {
    /// Consume `queue` under a generated consumer tag
    pub fn new(queue: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            consumer_tag: format!("meridian-{}", Uuid::new_v4()),
            prefetch: None,
        }
    }

    /// Set consumer tag
    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.consumer_tag = tag.into();
        self
    }

    /// Set prefetch count
    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }
}

/// Queue occupancy as reported by the broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueStatus {
    pub name: String,
    /// Messages ready for delivery
    pub message_count: u64,
    pub consumer_count: u32,
}
