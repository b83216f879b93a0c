//! Event type to schema registry

use std::collections::HashMap;

use crate::catalog::EventType;
use crate::event::EventPayload;
use crate::schema::Schema;

#[derive(Debug, Clone)]
struct Registered {
    schema: Schema,
    version: String,
}

/// Schemas by event type tag.
#[derive(Debug, Clone, Default)]
pub struct SchemaRegistry {
    schemas: HashMap<String, Registered>,
}

impl SchemaRegistry {
    /// An empty registry; every event type is unknown until registered.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every type of the built-in catalog.
    pub fn with_catalog() -> Self {
        let mut registry = Self::new();
        for event_type in EventType::KNOWN {
            if let Some((schema, version)) = event_type.schema() {
                registry.register(event_type.as_str(), schema, version);
            }
        }
        registry
    }

    /// Register (or replace) the schema of `event_type`.
    pub fn register(
        &mut self,
        event_type: impl Into<String>,
        schema: Schema,
        version: impl Into<String>,
    ) -> &mut Self {
        self.schemas.insert(
            event_type.into(),
            Registered {
                schema,
                version: version.into(),
            },
        );
        self
    }

    /// Register a payload type under its own tag and schema.
    pub fn register_payload<T: EventPayload>(&mut self) -> &mut Self {
        self.register(T::EVENT_TYPE, T::schema(), T::SCHEMA_VERSION)
    }

    pub fn get(&self, event_type: &str) -> Option<&Schema> {
        self.schemas.get(event_type).map(|r| &r.schema)
    }

    pub fn version(&self, event_type: &str) -> Option<&str> {
        self.schemas.get(event_type).map(|r| r.version.as_str())
    }

    pub fn contains(&self, event_type: &str) -> bool {
        self.schemas.contains_key(event_type)
    }

    /// Registered tags, sorted.
    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.schemas.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.schemas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.schemas.is_empty()
    }
}
