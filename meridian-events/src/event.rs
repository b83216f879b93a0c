//! Event envelope and payload traits

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use uuid::Uuid;

use crate::schema::Schema;

/// Envelope version stamped on events this crate creates.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Envelope metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventMetadata {
    /// Envelope version
    pub version: String,

    /// Service that produced the event
    pub source: String,

    /// Shared by every event of one causal chain
    pub correlation_id: String,

    /// When the event was created
    pub timestamp: DateTime<Utc>,

    /// Version of the payload schema
    pub schema_version: String,
}

impl EventMetadata {
    /// Metadata for a new causal chain produced by `source`
    pub fn new(source: impl Into<String>) -> Self {
        Self {
            version: ENVELOPE_VERSION.to_string(),
            source: source.into(),
            correlation_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            schema_version: "1".to_string(),
        }
    }

    /// Join an existing causal chain
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = id.into();
        self
    }

    pub fn with_schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = version.into();
        self
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// A typed event: `{ "type", "data", "metadata" }` on the wire.
///
/// Events are immutable; the accessors hand out references only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event<T> {
    #[serde(rename = "type")]
    event_type: String,
    data: T,
    metadata: EventMetadata,
}

impl<T> Event<T> {
    pub fn new(event_type: impl Into<String>, data: T, metadata: EventMetadata) -> Self {
        Self {
            event_type: event_type.into(),
            data,
            metadata,
        }
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn data(&self) -> &T {
        &self.data
    }

    pub fn metadata(&self) -> &EventMetadata {
        &self.metadata
    }

    pub fn correlation_id(&self) -> &str {
        &self.metadata.correlation_id
    }

    pub fn into_data(self) -> T {
        self.data
    }

    pub fn into_parts(self) -> (String, T, EventMetadata) {
        (self.event_type, self.data, self.metadata)
    }
}

impl<T: EventPayload> Event<T> {
    /// Start a new causal chain with a cataloged payload.
    pub fn typed(data: T, source: impl Into<String>) -> Self {
        let metadata = EventMetadata::new(source).with_schema_version(T::SCHEMA_VERSION);
        Self::new(T::EVENT_TYPE, data, metadata)
    }

    /// An event caused by `parent`: same chain, same source.
    pub fn caused_by<P>(parent: &Event<P>, data: T) -> Self {
        let metadata = EventMetadata::new(parent.metadata.source.clone())
            .with_correlation_id(parent.metadata.correlation_id.clone())
            .with_schema_version(T::SCHEMA_VERSION);
        Self::new(T::EVENT_TYPE, data, metadata)
    }
}

/// A payload type known at compile time.
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Type tag, also the routing key
    const EVENT_TYPE: &'static str;

    const SCHEMA_VERSION: &'static str = "1";

    /// Structural schema the payload is validated against
    fn schema() -> Schema;
}
