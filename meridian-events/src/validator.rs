//! Two-phase event validation: envelope first, then the payload against the
//! schema registered for the event type.
//!
//! Validation never mutates its input. Unknown event types are rejected so
//! unvalidated payloads never reach a handler.

use std::sync::Arc;

use chrono::DateTime;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{FieldError, FieldErrors, ValidationError};
use crate::event::{Event, EventPayload};
use crate::registry::SchemaRegistry;

/// Validates event envelopes and payloads against a [`SchemaRegistry`].
#[derive(Debug, Clone)]
pub struct EventValidator {
    registry: Arc<SchemaRegistry>,
    require_uuid_correlation: bool,
}

impl EventValidator {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self::from_shared(Arc::new(registry))
    }

    pub fn from_shared(registry: Arc<SchemaRegistry>) -> Self {
        Self {
            registry,
            require_uuid_correlation: true,
        }
    }

    /// Whether `metadata.correlationId` must be a UUID (default `true`).
    pub fn require_uuid_correlation(mut self, required: bool) -> Self {
        self.require_uuid_correlation = required;
        self
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Validate a decoded envelope and narrow it to `Event<T>`.
    pub fn validate<T: DeserializeOwned>(&self, value: &Value) -> Result<Event<T>, ValidationError> {
        self.check(value)?;
        serde_json::from_value(value.clone()).map_err(|e| ValidationError::Malformed(e.to_string()))
    }

    /// Like [`validate`](Self::validate), additionally requiring the tag of `T`.
    pub fn validate_as<T: EventPayload>(&self, value: &Value) -> Result<Event<T>, ValidationError> {
        let actual = value.get("type").and_then(Value::as_str).unwrap_or_default();
        if actual != T::EVENT_TYPE {
            return Err(ValidationError::TypeMismatch {
                expected: T::EVENT_TYPE.to_string(),
                actual: actual.to_string(),
            });
        }
        self.validate(value)
    }

    /// Decode and validate a message body.
    pub fn validate_bytes<T: DeserializeOwned>(&self, body: &[u8]) -> Result<Event<T>, ValidationError> {
        let value: Value =
            serde_json::from_slice(body).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.validate(&value)
    }

    /// Validate an event about to be published, returning its wire form.
    pub fn validate_outbound<T: Serialize>(&self, event: &Event<T>) -> Result<Value, ValidationError> {
        let value =
            serde_json::to_value(event).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        self.check(&value)?;
        Ok(value)
    }

    /// Run both phases without decoding the payload.
    pub fn check(&self, value: &Value) -> Result<(), ValidationError> {
        let event_type = self.check_envelope(value)?;
        let schema = self
            .registry
            .get(event_type)
            .ok_or_else(|| ValidationError::UnknownEventType(event_type.to_string()))?;

        let data = value.get("data").unwrap_or(&Value::Null);
        schema
            .validate_at("data", data)
            .map_err(|errors| ValidationError::Payload {
                event_type: event_type.to_string(),
                errors,
            })
    }

    fn check_envelope<'a>(&self, value: &'a Value) -> Result<&'a str, ValidationError> {
        let mut errors = FieldErrors::default();
        let Some(envelope) = value.as_object() else {
            errors.push(FieldError::new("$", "isObject", "event must be a JSON object"));
            return Err(ValidationError::Envelope(errors));
        };

        let event_type = non_empty_string(envelope, "type", "type", &mut errors);

        if !envelope.contains_key("data") {
            errors.push(FieldError::new("data", "required", "data is required"));
        }

        match envelope.get("metadata") {
            Some(Value::Object(metadata)) => self.check_metadata(metadata, &mut errors),
            Some(_) => errors.push(FieldError::new(
                "metadata",
                "isObject",
                "metadata must be an object",
            )),
            None => errors.push(FieldError::new("metadata", "required", "metadata is required")),
        }

        match event_type {
            Some(event_type) if errors.is_empty() => Ok(event_type),
            _ => Err(ValidationError::Envelope(errors)),
        }
    }

    fn check_metadata(&self, metadata: &Map<String, Value>, errors: &mut FieldErrors) {
        non_empty_string(metadata, "version", "metadata.version", errors);
        non_empty_string(metadata, "source", "metadata.source", errors);
        non_empty_string(metadata, "schemaVersion", "metadata.schemaVersion", errors);

        if let Some(id) = non_empty_string(metadata, "correlationId", "metadata.correlationId", errors)
            && self.require_uuid_correlation
            && Uuid::parse_str(id).is_err()
        {
            errors.push(FieldError::new(
                "metadata.correlationId",
                "isUuid",
                "correlationId must be a UUID",
            ));
        }

        if let Some(timestamp) = non_empty_string(metadata, "timestamp", "metadata.timestamp", errors)
            && DateTime::parse_from_rfc3339(timestamp).is_err()
        {
            errors.push(FieldError::new(
                "metadata.timestamp",
                "isTimestamp",
                "timestamp must be an RFC 3339 timestamp",
            ));
        }
    }
}

fn non_empty_string<'a>(
    object: &'a Map<String, Value>,
    key: &str,
    path: &str,
    errors: &mut FieldErrors,
) -> Option<&'a str> {
    match object.get(key) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s),
        Some(Value::String(_)) => {
            errors.push(FieldError::new(
                path,
                "notEmpty",
                format!("{} should not be empty", key),
            ));
            None
        }
        Some(Value::Null) | None => {
            errors.push(FieldError::new(path, "required", format!("{} is required", key)));
            None
        }
        Some(_) => {
            errors.push(FieldError::new(
                path,
                "isString",
                format!("{} must be a string", key),
            ));
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Ping, UserCreated};
    use serde_json::json;

    fn validator() -> EventValidator {
        EventValidator::new(SchemaRegistry::with_catalog())
    }

    fn user_created(data: Value) -> Value {
        json!({
            "type": "USER_CREATED",
            "data": data,
            "metadata": {
                "version": "1.0",
                "source": "accounts",
                "correlationId": "5b0c52b6-8a4e-4c5e-9a7c-6f1de0a0f0c1",
                "timestamp": "2024-05-01T12:00:00Z",
                "schemaVersion": "1"
            }
        })
    }

    #[test]
    fn test_well_formed_user_created_round_trips() {
        let data = json!({
            "userId": "0d9f2a51-7d3e-4b8e-a1c4-2b6f0c9e8d11",
            "email": "ana@example.com",
            "name": "Ana"
        });
        let input = user_created(data.clone());

        let event: Event<UserCreated> = validator().validate(&input).unwrap();

        assert_eq!(event.event_type(), "USER_CREATED");
        assert_eq!(event.data().name, "Ana");
        assert_eq!(event.metadata().source, "accounts");
        assert_eq!(serde_json::to_value(&event).unwrap()["data"], data);
        assert_eq!(input, user_created(data));
    }

    #[test]
    fn test_missing_required_field_is_descriptive() {
        let input = user_created(json!({
            "userId": "0d9f2a51-7d3e-4b8e-a1c4-2b6f0c9e8d11",
            "name": "Ana"
        }));

        let err = validator().validate::<UserCreated>(&input).unwrap_err();
        match &err {
            ValidationError::Payload { event_type, errors } => {
                assert_eq!(event_type, "USER_CREATED");
                assert_eq!(errors.len(), 1);
                assert_eq!(errors.field("data.email").unwrap().constraint, "required");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(
            err.to_string(),
            "invalid USER_CREATED payload: data.email: email is required"
        );
    }

    #[test]
    fn test_unknown_type_fails_closed() {
        let mut input = user_created(json!({}));
        input["type"] = json!("INVOICE_SENT");

        assert_eq!(
            validator().validate::<Value>(&input).unwrap_err(),
            ValidationError::UnknownEventType("INVOICE_SENT".into())
        );
    }

    #[test]
    fn test_envelope_errors() {
        let input = json!({
            "type": "PING",
            "data": {},
            "metadata": {
                "version": "",
                "source": "gateway",
                "correlationId": "c1",
                "timestamp": "not a time"
            }
        });

        let err = validator().validate::<Ping>(&input).unwrap_err();
        let errors = err.field_errors().unwrap();
        assert_eq!(errors.field("metadata.version").unwrap().constraint, "notEmpty");
        assert_eq!(errors.field("metadata.correlationId").unwrap().constraint, "isUuid");
        assert_eq!(errors.field("metadata.timestamp").unwrap().constraint, "isTimestamp");
        assert_eq!(errors.field("metadata.schemaVersion").unwrap().constraint, "required");

        assert!(matches!(
            validator().validate_bytes::<Ping>(b"not json"),
            Err(ValidationError::Malformed(_))
        ));
    }

    #[test]
    fn test_non_uuid_correlation_when_allowed() {
        let input = json!({
            "type": "PING",
            "data": {},
            "metadata": {
                "version": "1.0",
                "source": "gateway",
                "correlationId": "c1",
                "timestamp": "2024-05-01T12:00:00Z",
                "schemaVersion": "1"
            }
        });

        let event: Event<Ping> = validator()
            .require_uuid_correlation(false)
            .validate(&input)
            .unwrap();
        assert_eq!(event.correlation_id(), "c1");
    }

    #[test]
    fn test_validate_as_checks_type() {
        let input = user_created(json!({}));
        assert!(matches!(
            validator().validate_as::<Ping>(&input),
            Err(ValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn test_validate_outbound() {
        let event = Event::typed(Ping::default(), "gateway");
        let wire = validator().validate_outbound(&event).unwrap();
        assert_eq!(wire["type"], "PING");

        let nameless = Event::typed(Ping::default(), "");
        assert!(matches!(
            validator().validate_outbound(&nameless),
            Err(ValidationError::Envelope(_))
        ));
    }
}
