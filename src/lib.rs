// Meridian - resilient event distribution for services
//
// This library publishes and consumes validated, typed events over a message
// broker, with circuit breakers around every dependency, a pooled cache for
// de-duplication, batched publishing, and health and metrics reporting.

// Re-export the event bus
pub use meridian_events::*;

// Handler implementations use `#[meridian::async_trait]`
pub use async_trait::async_trait;

// Re-export component crates
pub use meridian_health as health;
pub use meridian_log as log;
pub use meridian_messaging as messaging;
pub use meridian_metrics as metrics;
pub use meridian_redis as redis;
pub use meridian_resilience as resilience;

// Prelude for common imports
pub mod prelude {
    pub use crate::{
        BusConfig,
        BusError,
        Event,
        EventBus,
        EventHandler,
        EventHandlerError,
        EventPayload,
        PublishOptions,
        PublishOutcome,
        SubscribeOptions,
        handler_fn,
    };
    pub use async_trait::async_trait;
    pub use meridian_health::{HealthChecker, HealthReport, HealthStatus};
    pub use meridian_messaging::{BrokerChannel, MemoryBroker};
    pub use meridian_metrics::MetricsRegistry;
    pub use meridian_redis::{CacheStore, MemoryCache};
    pub use meridian_resilience::{CircuitBreaker, CircuitBreakerConfig, CircuitBreakerError};
}
