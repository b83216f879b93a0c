//! Metrics error types

use thiserror::Error;

/// Result type for metrics operations.
pub type Result<T> = std::result::Result<T, MetricsError>;

/// Errors raised while building a metrics registry.
#[derive(Debug, Error)]
pub enum MetricsError {
    /// A collector could not be created or registered.
    #[error("Metric registration failed: {0}")]
    Registration(#[from] prometheus::Error),

    /// The namespace is not a valid Prometheus metric prefix.
    #[error("Invalid metrics namespace '{0}'")]
    InvalidNamespace(String),
}
