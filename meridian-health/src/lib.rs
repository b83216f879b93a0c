//! # Meridian Health
//!
//! Liveness of the message broker and the cache store, aggregated into one
//! report for an external health endpoint:
//!
//! ```json
//! {
//!   "status": "healthy",
//!   "details": {
//!     "broker": { "connected": true, "exchangeAvailable": true,
//!                 "queues": [{ "name": "billing.PING", "available": true, "messageCount": 0 }] },
//!     "cache": { "connected": true, "latency": 0.4, "memoryUsage": "1.02M" }
//!   },
//!   "timestamp": "2024-05-01T12:00:00Z"
//! }
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meridian_health::{BrokerHealthIndicator, CacheHealthIndicator, HealthChecker};
//!
//! let checker = HealthChecker::new()
//!     .with_indicator(BrokerHealthIndicator::new(channel, "events").with_queue("billing.PING"))
//!     .with_indicator(CacheHealthIndicator::new(cache));
//!
//! let report = checker.check().await;
//! let code = report.status.http_status_code();
//! ```

mod broker;
mod cache;
mod checker;
mod indicator;

pub use broker::{BrokerHealth, BrokerHealthIndicator, QueueHealth};
pub use cache::{CacheHealth, CacheHealthIndicator};
pub use checker::{HealthChecker, HealthReport};
pub use indicator::{ComponentHealth, HealthIndicator, HealthStatus};
