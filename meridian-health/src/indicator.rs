//! Health indicators and per-component results.

use async_trait::async_trait;
use meridian_metrics::MetricsRegistry;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// Health status of a component or of the whole bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    /// Component is functioning normally
    #[default]
    Healthy,
    /// Component is unreachable or misconfigured
    Unhealthy,
}

impl HealthStatus {
    pub fn is_healthy(&self) -> bool {
        matches!(self, HealthStatus::Healthy)
    }

    /// Returns the HTTP status code for this health status
    pub fn http_status_code(&self) -> u16 {
        match self {
            HealthStatus::Healthy => 200,
            HealthStatus::Unhealthy => 503,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
        }
    }
}

/// Result of checking one component.
///
/// Serializes as its detail fields, plus `error` when the check failed.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentHealth {
    pub name: String,
    pub status: HealthStatus,
    pub details: Map<String, Value>,
    pub error: Option<String>,
}

impl ComponentHealth {
    pub fn healthy(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            status: HealthStatus::Healthy,
            details: Map::new(),
            error: None,
        }
    }

    pub fn unhealthy(name: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            ..Self::healthy(name)
        }
    }

    /// Adds a detail to the result
    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.details.insert(key.into(), value.into());
        self
    }

    /// Merge the fields of a serializable details struct.
    pub fn with_details<T: Serialize>(mut self, details: &T) -> Self {
        match serde_json::to_value(details) {
            Ok(Value::Object(fields)) => self.details.extend(fields),
            Ok(other) => {
                self.details.insert("value".to_string(), other);
            }
            Err(e) => return self.with_error(e.to_string()),
        }
        self
    }

    /// Sets the error message and marks the component unhealthy
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self.status = HealthStatus::Unhealthy;
        self
    }

    pub fn detail(&self, key: &str) -> Option<&Value> {
        self.details.get(key)
    }
}

impl Serialize for ComponentHealth {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut fields = self.details.clone();
        if let Some(error) = &self.error {
            fields.insert("error".to_string(), Value::String(error.clone()));
        }
        fields.serialize(serializer)
    }
}

/// Trait for components the [`HealthChecker`](crate::HealthChecker) probes.
///
/// ## Example
///
/// ```rust
/// use meridian_health::{ComponentHealth, HealthIndicator};
/// use async_trait::async_trait;
///
/// struct LedgerHealthIndicator;
///
/// #[async_trait]
/// impl HealthIndicator for LedgerHealthIndicator {
///     fn name(&self) -> &str {
///         "ledger"
///     }
///
///     async fn check(&self) -> ComponentHealth {
///         ComponentHealth::healthy("ledger").with_detail("replicas", 3)
///     }
/// }
/// ```
#[async_trait]
pub trait HealthIndicator: Send + Sync {
    /// Key of this component in the report's `details`
    fn name(&self) -> &str;

    /// Performs the health check and returns the result
    async fn check(&self) -> ComponentHealth;

    /// Result reported when [`check`](Self::check) could not finish.
    fn unavailable(&self, error: String) -> ComponentHealth {
        ComponentHealth::unhealthy(self.name()).with_error(error)
    }

    /// Whether an unhealthy result makes the whole report unhealthy.
    fn is_critical(&self) -> bool {
        false
    }

    /// Push gauges this indicator can observe into `metrics`.
    async fn record_metrics(&self, _metrics: &MetricsRegistry) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Serialize)]
    #[serde(rename_all = "camelCase")]
    struct Sample {
        connected: bool,
        message_count: u64,
    }

    #[test]
    fn test_health_status_codes() {
        assert!(HealthStatus::Healthy.is_healthy());
        assert!(!HealthStatus::Unhealthy.is_healthy());
        assert_eq!(HealthStatus::Healthy.http_status_code(), 200);
        assert_eq!(HealthStatus::Unhealthy.http_status_code(), 503);
        assert_eq!(HealthStatus::Unhealthy.to_string(), "unhealthy");
    }

    #[test]
    fn test_details_flatten_into_json() {
        let health = ComponentHealth::healthy("broker").with_details(&Sample {
            connected: true,
            message_count: 4,
        });

        assert_eq!(
            serde_json::to_value(&health).unwrap(),
            serde_json::json!({ "connected": true, "messageCount": 4 })
        );
    }

    #[test]
    fn test_error_marks_unhealthy() {
        let health = ComponentHealth::healthy("cache")
            .with_detail("connected", false)
            .with_error("connection refused");

        assert_eq!(health.status, HealthStatus::Unhealthy);
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["error"], "connection refused");
        assert_eq!(json["connected"], false);
    }
}
