//! Event bus configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::BusError;

/// Settings shared by every publisher and subscription of one bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Stamped as `metadata.source` and used to name durable queues
    pub service_name: String,

    /// Topic exchange events are published to, routed by event type
    pub exchange: String,

    /// Where deliveries go once broker-side retries are exhausted
    pub dead_letter_exchange: String,

    /// Namespace of the de-duplication keys inside the cache store
    pub cache_prefix: String,

    /// How long a published or processed correlation id is remembered
    #[serde(with = "duration_secs")]
    pub dedup_ttl: Duration,

    pub batch_size: usize,

    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,

    /// Pending batched messages allowed before `publish` fails
    pub max_buffer: usize,

    /// Broker-side redeliveries of a rejected message
    pub max_retries: u32,

    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,

    /// Default unacknowledged deliveries per subscription
    pub prefetch: u16,

    /// Consecutive failures that open a breaker
    pub error_threshold: u32,

    #[serde(with = "duration_secs")]
    pub reset_timeout: Duration,

    /// Upper bound on one handler invocation
    #[serde(with = "duration_secs")]
    pub handler_timeout: Duration,

    /// Upper bound on one broker or cache round trip
    #[serde(with = "duration_secs")]
    pub operation_timeout: Duration,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            service_name: "meridian".to_string(),
            exchange: "events".to_string(),
            dead_letter_exchange: "events.dead-letter".to_string(),
            cache_prefix: "events".to_string(),
            dedup_ttl: Duration::from_secs(3600),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_buffer: 10_000,
            max_retries: 3,
            retry_delay: Duration::from_secs(5),
            prefetch: 10,
            error_threshold: 5,
            reset_timeout: Duration::from_secs(30),
            handler_timeout: Duration::from_secs(30),
            operation_timeout: Duration::from_secs(5),
        }
    }
}

impl BusConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    /// Load configuration from environment variables.
    ///
    /// - `MERIDIAN_SERVICE_NAME`, `MERIDIAN_EXCHANGE`, `MERIDIAN_DEAD_LETTER_EXCHANGE`
    /// - `MERIDIAN_CACHE_PREFIX`, `MERIDIAN_DEDUP_TTL_SECS`
    /// - `MERIDIAN_BATCH_SIZE`, `MERIDIAN_FLUSH_INTERVAL_MS`
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) over an arbitrary lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(name) = lookup("MERIDIAN_SERVICE_NAME") {
            config.service_name = name;
        }
        if let Some(exchange) = lookup("MERIDIAN_EXCHANGE") {
            config.exchange = exchange;
        }
        if let Some(exchange) = lookup("MERIDIAN_DEAD_LETTER_EXCHANGE") {
            config.dead_letter_exchange = exchange;
        }
        if let Some(prefix) = lookup("MERIDIAN_CACHE_PREFIX") {
            config.cache_prefix = prefix;
        }
        if let Some(secs) = lookup("MERIDIAN_DEDUP_TTL_SECS")
            && let Ok(secs) = secs.parse()
        {
            config.dedup_ttl = Duration::from_secs(secs);
        }
        if let Some(size) = lookup("MERIDIAN_BATCH_SIZE")
            && let Ok(size) = size.parse()
        {
            config.batch_size = size;
        }
        if let Some(ms) = lookup("MERIDIAN_FLUSH_INTERVAL_MS")
            && let Ok(ms) = ms.parse()
        {
            config.flush_interval = Duration::from_millis(ms);
        }

        config
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = exchange.into();
        self
    }

    pub fn with_dead_letter_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter_exchange = exchange.into();
        self
    }

    pub fn with_dedup_ttl(mut self, ttl: Duration) -> Self {
        self.dedup_ttl = ttl;
        self
    }

    pub fn with_batching(mut self, batch_size: usize, flush_interval: Duration) -> Self {
        self.batch_size = batch_size;
        self.flush_interval = flush_interval;
        self
    }

    pub fn with_retries(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.retry_delay = retry_delay;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    /// Breaker settings for the broker, the cache and every handler.
    pub fn with_breaker(mut self, error_threshold: u32, reset_timeout: Duration) -> Self {
        self.error_threshold = error_threshold;
        self.reset_timeout = reset_timeout;
        self
    }

    pub fn with_handler_timeout(mut self, timeout: Duration) -> Self {
        self.handler_timeout = timeout;
        self
    }

    pub fn with_operation_timeout(mut self, timeout: Duration) -> Self {
        self.operation_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), BusError> {
        let invalid = |msg: &str| Err(BusError::Configuration(msg.to_string()));

        if self.service_name.trim().is_empty() {
            return invalid("service_name must not be empty");
        }
        if self.exchange.is_empty() {
            return invalid("exchange must not be empty");
        }
        if self.dead_letter_exchange.is_empty() || self.dead_letter_exchange == self.exchange {
            return invalid("dead_letter_exchange must be set and differ from exchange");
        }
        if self.batch_size == 0 || self.max_buffer < self.batch_size {
            return invalid("batch_size must be positive and at most max_buffer");
        }
        if self.flush_interval.is_zero() {
            return invalid("flush_interval must be positive");
        }
        if self.dedup_ttl.is_zero() {
            return invalid("dedup_ttl must be positive");
        }
        if self.error_threshold == 0 {
            return invalid("error_threshold must be positive");
        }
        if self.handler_timeout.is_zero() || self.operation_timeout.is_zero() {
            return invalid("timeouts must be positive");
        }
        Ok(())
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_are_valid() {
        let config = BusConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.exchange, "events");
        assert_eq!(config.dedup_ttl, Duration::from_secs(3600));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("MERIDIAN_SERVICE_NAME", "billing"),
            ("MERIDIAN_DEDUP_TTL_SECS", "60"),
            ("MERIDIAN_BATCH_SIZE", "25"),
            ("MERIDIAN_FLUSH_INTERVAL_MS", "250"),
            ("MERIDIAN_EXCHANGE", "domain"),
            ("MERIDIAN_DEAD_LETTER_EXCHANGE", "domain.dlx"),
        ]
        .into_iter()
        .collect();

        let config = BusConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.service_name, "billing");
        assert_eq!(config.dedup_ttl, Duration::from_secs(60));
        assert_eq!(config.batch_size, 25);
        assert_eq!(config.flush_interval, Duration::from_millis(250));
        assert_eq!(config.exchange, "domain");
        assert_eq!(config.dead_letter_exchange, "domain.dlx");
        assert_eq!(config.cache_prefix, "events");
    }

    #[test]
    fn test_validate() {
        assert!(BusConfig::new(" ").validate().is_err());
        assert!(
            BusConfig::default()
                .with_dead_letter_exchange("events")
                .validate()
                .is_err()
        );
        assert!(
            BusConfig::default()
                .with_batching(0, Duration::from_secs(1))
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_serde_uses_seconds() {
        let json = serde_json::to_value(BusConfig::default().with_dedup_ttl(Duration::from_millis(1500)))
            .unwrap();
        assert_eq!(json["dedup_ttl"], 1.5);

        let parsed: BusConfig =
            serde_json::from_str(r#"{ "service_name": "audit", "retry_delay": 0.25 }"#).unwrap();
        assert_eq!(parsed.service_name, "audit");
        assert_eq!(parsed.retry_delay, Duration::from_millis(250));
        assert_eq!(parsed.exchange, "events");
    }
}
