//! Cache store health.

use std::sync::Arc;

use async_trait::async_trait;
use meridian_redis::CacheStore;
use serde::Serialize;
use tracing::debug;

use crate::indicator::{ComponentHealth, HealthIndicator};

/// Cache section of the health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHealth {
    pub connected: bool,
    /// `PING` round trip in milliseconds
    pub latency: Option<f64>,
    /// `used_memory_human` from `INFO`, or raw bytes when the server omits it
    pub memory_usage: Option<String>,
}

/// Pings the cache store and reads its memory usage.
pub struct CacheHealthIndicator {
    cache: Arc<dyn CacheStore>,
}

impl CacheHealthIndicator {
    pub fn new(cache: Arc<dyn CacheStore>) -> Self {
        Self { cache }
    }

    pub async fn probe(&self) -> CacheHealth {
        let latency = match self.cache.ping().await {
            Ok(latency) => latency,
            Err(e) => {
                debug!(prefix = %self.cache.prefix(), error = %e, "Cache ping failed");
                return Self::disconnected();
            }
        };

        let memory_usage = match self.cache.info().await {
            Ok(info) => info
                .used_memory_human
                .or_else(|| info.used_memory.map(|bytes| bytes.to_string())),
            Err(e) => {
                debug!(error = %e, "Cache INFO failed");
                None
            }
        };

        CacheHealth {
            connected: true,
            latency: Some(latency.as_secs_f64() * 1000.0),
            memory_usage,
        }
    }

    fn disconnected() -> CacheHealth {
        CacheHealth {
            connected: false,
            latency: None,
            memory_usage: None,
        }
    }
}

#[async_trait]
impl HealthIndicator for CacheHealthIndicator {
    fn name(&self) -> &str {
        "cache"
    }

    async fn check(&self) -> ComponentHealth {
        let health = self.probe().await;
        let result = if health.connected {
            ComponentHealth::healthy("cache")
        } else {
            ComponentHealth::unhealthy("cache")
        };
        result.with_details(&health)
    }

    fn unavailable(&self, error: String) -> ComponentHealth {
        ComponentHealth::unhealthy("cache")
            .with_details(&Self::disconnected())
            .with_error(error)
    }

    fn is_critical(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_redis::MemoryCache;

    #[tokio::test]
    async fn test_connected_cache() {
        let cache = Arc::new(MemoryCache::new("svc"));
        cache.set("k", "value", None).await.unwrap();

        let health = CacheHealthIndicator::new(cache).probe().await;
        assert!(health.connected);
        assert_eq!(health.latency, Some(0.0));
        assert!(health.memory_usage.is_some());
    }

    #[tokio::test]
    async fn test_unreachable_cache() {
        let cache = Arc::new(MemoryCache::new("svc"));
        cache.set_available(false);

        let indicator = CacheHealthIndicator::new(cache);
        let result = indicator.check().await;
        assert!(!result.status.is_healthy());
        assert_eq!(
            serde_json::to_value(&result).unwrap(),
            serde_json::json!({ "connected": false, "latency": null, "memoryUsage": null })
        );
    }
}
