//! Validation and bus errors

use std::fmt;
use std::time::Duration;

use meridian_messaging::{BatchError, MessagingError};
use meridian_redis::RedisError;
use meridian_resilience::CircuitBreakerError;
use thiserror::Error;

/// A single field that failed validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    /// Dotted path of the field, e.g. `data.email` or `data.tags[1]`
    pub field: String,

    /// Error message
    pub message: String,

    /// Validation constraint that failed
    pub constraint: String,
}

impl FieldError {
    pub fn new(
        field: impl Into<String>,
        constraint: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
            constraint: constraint.into(),
        }
    }
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Collection of field errors
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldErrors(pub Vec<FieldError>);

impl FieldErrors {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldError> {
        self.0.iter()
    }

    /// The error for `field`, if that field failed.
    pub fn field(&self, field: &str) -> Option<&FieldError> {
        self.0.iter().find(|e| e.field == field)
    }

    pub(crate) fn into_result(self) -> Result<(), FieldErrors> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", error)?;
        }
        Ok(())
    }
}

/// Why an event was rejected by the validator
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    /// Not JSON, or not decodable into the requested payload type
    #[error("malformed event: {0}")]
    Malformed(String),

    /// Type tag or metadata missing or ill-formed
    #[error("invalid event envelope: {0}")]
    Envelope(FieldErrors),

    /// No schema is registered for the event type
    #[error("unknown event type '{0}'")]
    UnknownEventType(String),

    /// The payload does not satisfy the schema of its event type
    #[error("invalid {event_type} payload: {errors}")]
    Payload {
        event_type: String,
        errors: FieldErrors,
    },

    /// A handler for one event type received another
    #[error("expected event type {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

impl ValidationError {
    /// Field-level errors, when the failure was a schema or envelope check.
    pub fn field_errors(&self) -> Option<&FieldErrors> {
        match self {
            Self::Envelope(errors) | Self::Payload { errors, .. } => Some(errors),
            _ => None,
        }
    }
}

/// Error categories callers branch on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed envelope or payload; never retried
    Validation,
    /// Broker or cache unreachable
    Connection,
    /// An operation exceeded its bound
    Timeout,
    /// A pool or buffer is exhausted
    Capacity,
    /// A circuit breaker rejected the call without making it
    CircuitOpen,
    /// A subscriber's handler failed
    Handler,
    /// The bus or one of its components is closed
    Closed,
}

/// Errors returned by the [`EventBus`](crate::EventBus)
#[derive(Debug, Error)]
pub enum BusError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("broker error: {0}")]
    Broker(#[from] MessagingError),

    #[error("cache error: {0}")]
    Cache(#[from] RedisError),

    #[error("batch error: {0}")]
    Batch(#[from] BatchError),

    /// The breaker guarding the named dependency is open
    #[error("circuit breaker '{0}' is open")]
    CircuitOpen(String),

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("handler for {event_type} failed: {message}")]
    Handler { event_type: String, message: String },

    #[error("serialization failed: {0}")]
    Serialization(String),

    #[error("invalid bus configuration: {0}")]
    Configuration(String),

    #[error("event bus is closed")]
    Closed,
}

impl BusError {
    /// Convert the outcome of a breaker-wrapped call against `breaker`.
    pub(crate) fn from_breaker<E: Into<BusError>>(breaker: &str, err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::Open => Self::CircuitOpen(breaker.to_string()),
            CircuitBreakerError::Timeout(after) => Self::Timeout {
                operation: breaker.to_string(),
                after,
            },
            CircuitBreakerError::Execution(e) => e.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation(_) | Self::Serialization(_) | Self::Configuration(_) => {
                ErrorKind::Validation
            }
            Self::Broker(e) => messaging_kind(e),
            Self::Cache(e) => match e {
                RedisError::AcquireTimeout(_) => ErrorKind::Capacity,
                RedisError::Timeout => ErrorKind::Timeout,
                RedisError::PoolClosing => ErrorKind::Closed,
                RedisError::Serialization(_) | RedisError::Config(_) => ErrorKind::Validation,
                _ => ErrorKind::Connection,
            },
            Self::Batch(e) => match e {
                BatchError::BufferFull { .. } => ErrorKind::Capacity,
                BatchError::Closed => ErrorKind::Closed,
                BatchError::Dropped { source, .. } | BatchError::Requeued { source, .. } => {
                    messaging_kind(source)
                }
            },
            Self::CircuitOpen(_) => ErrorKind::CircuitOpen,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Closed => ErrorKind::Closed,
        }
    }

    /// Whether the caller may retry after backing off.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Timeout | ErrorKind::Capacity | ErrorKind::CircuitOpen
        )
    }
}

fn messaging_kind(error: &MessagingError) -> ErrorKind {
    match error {
        MessagingError::Timeout(_) => ErrorKind::Timeout,
        MessagingError::ResourceExhausted(_) => ErrorKind::Capacity,
        MessagingError::ChannelClosed(_) => ErrorKind::Closed,
        MessagingError::Serialization(_)
        | MessagingError::Deserialization(_)
        | MessagingError::Configuration(_) => ErrorKind::Validation,
        _ => ErrorKind::Connection,
    }
}

/// Error returned by an [`EventHandler`](crate::EventHandler)
#[derive(Debug, Error)]
pub enum EventHandlerError {
    #[error("Handler failed: {0}")]
    HandlerFailed(String),

    #[error("Event processing error: {0}")]
    ProcessingError(String),
}

impl From<String> for EventHandlerError {
    fn from(message: String) -> Self {
        Self::HandlerFailed(message)
    }
}

impl From<&str> for EventHandlerError {
    fn from(message: &str) -> Self {
        Self::HandlerFailed(message.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_errors_display() {
        let errors = FieldErrors(vec![
            FieldError::new("data.email", "required", "email is required"),
            FieldError::new("data.userId", "uuid", "userId must be a UUID"),
        ]);
        assert_eq!(
            errors.to_string(),
            "data.email: email is required; data.userId: userId must be a UUID"
        );
        assert_eq!(errors.field("data.email").unwrap().constraint, "required");
    }

    #[test]
    fn test_error_kinds() {
        let cases = [
            (
                BusError::from(ValidationError::UnknownEventType("X".into())),
                ErrorKind::Validation,
            ),
            (
                BusError::from(MessagingError::Connection("refused".into())),
                ErrorKind::Connection,
            ),
            (
                BusError::from(MessagingError::Timeout(Duration::from_secs(5))),
                ErrorKind::Timeout,
            ),
            (
                BusError::from(RedisError::AcquireTimeout(Duration::from_secs(1))),
                ErrorKind::Capacity,
            ),
            (
                BusError::from(BatchError::BufferFull {
                    pending: 10,
                    limit: 10,
                }),
                ErrorKind::Capacity,
            ),
            (BusError::CircuitOpen("broker".into()), ErrorKind::CircuitOpen),
            (BusError::Closed, ErrorKind::Closed),
        ];

        for (error, kind) in cases {
            assert_eq!(error.kind(), kind, "{error}");
        }
    }

    #[test]
    fn test_from_breaker() {
        let open = BusError::from_breaker::<MessagingError>("broker", CircuitBreakerError::Open);
        assert_eq!(open.kind(), ErrorKind::CircuitOpen);
        assert!(open.is_retryable());

        let timeout = BusError::from_breaker::<MessagingError>(
            "cache",
            CircuitBreakerError::Timeout(Duration::from_millis(50)),
        );
        assert_eq!(timeout.to_string(), "cache timed out after 50ms");

        let failed = BusError::from_breaker(
            "broker",
            CircuitBreakerError::Execution(MessagingError::Publish("no route".into())),
        );
        assert!(matches!(failed, BusError::Broker(MessagingError::Publish(_))));
        assert!(!BusError::from(ValidationError::Malformed("x".into())).is_retryable());
    }
}
