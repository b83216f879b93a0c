//! Prometheus metrics for Meridian event distribution
//!
//! A [`MetricsRegistry`] is an explicit instance, constructed once per bus and
//! shared by reference with the components that record into it (the event
//! bus, circuit breakers, the connection pool and the batch publisher).
//! Nothing here is global, so independent buses and tests never see each
//! other's numbers.
//!
//! Two read paths are offered:
//!
//! - [`MetricsRegistry::export`] renders Prometheus text format.
//! - [`MetricsRegistry::snapshot`] returns a serde-friendly [`MetricsSnapshot`]
//!   with per-event-type timing (count/avg/min/max), success and error
//!   counters, queue and dead-letter depths, and cache hit ratios.
//!
//! # Quick Start
//!
//! ```
//! use meridian_metrics::MetricsRegistry;
//! use std::time::Duration;
//!
//! let metrics = MetricsRegistry::new("meridian").unwrap();
//! metrics.record_event("PING", Duration::from_millis(4), true);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.events["PING"].success, 1);
//! assert!(metrics.export().contains("meridian_events_processed_total"));
//! ```

pub mod error;
pub mod registry;
pub mod snapshot;
pub mod timing;

pub use error::{MetricsError, Result};
pub use prometheus;
pub use registry::{CacheOutcome, DEFAULT_LATENCY_BUCKETS, MetricsRegistry};
pub use snapshot::{
    CacheSnapshot, CircuitSnapshot, EventTypeSnapshot, MetricsSnapshot, PoolSnapshot,
    QueueSnapshot,
};
pub use timing::{TimingSnapshot, TimingStats};

use prometheus::{Encoder, Registry, TextEncoder};

/// Export metrics from a specific registry as Prometheus text format.
pub fn export_from_registry(registry: &Registry) -> String {
    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!(error = %e, "Failed to encode metrics");
        return String::from("# Error encoding metrics\n");
    }

    String::from_utf8(buffer).unwrap_or_else(|_| String::from("# Error converting metrics to UTF-8\n"))
}
