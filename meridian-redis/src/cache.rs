//! Cache store boundary.
//!
//! Key-value operations only: `GET`, `SET` with TTL, `DEL`, `PING` and
//! `INFO`. Every key is namespaced by the store's prefix.

use crate::config::PoolConfig;
use crate::error::{RedisError, Result};
use crate::pool::{ConnectionManager, ConnectionPool, RedisConnectionManager};
use async_trait::async_trait;
use futures::FutureExt;
use meridian_metrics::MetricsRegistry;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

/// Cache store trait for the cache backends the bus can use.
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Get a value. `Ok(None)` when the key is absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()>;

    /// Delete a key. Returns whether it existed.
    async fn delete(&self, key: &str) -> Result<bool>;

    /// Round-trip latency.
    async fn ping(&self) -> Result<Duration>;

    /// Server statistics used by health reporting.
    async fn info(&self) -> Result<CacheInfo>;

    /// Release every connection held by the store.
    async fn close(&self) -> Result<()>;

    /// Namespace prepended to every key.
    fn prefix(&self) -> &str;

    /// Whether the store still accepts commands.
    fn is_connected(&self) -> bool;
}

/// Prefix `key` with `prefix`, separated by `:`.
pub fn namespaced(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{}:{}", prefix, key)
    }
}

/// Subset of `INFO` the health report exposes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheInfo {
    pub used_memory: Option<u64>,
    pub used_memory_human: Option<String>,
    pub connected_clients: Option<u64>,
    pub redis_version: Option<String>,
}

impl CacheInfo {
    /// Parse the `key:value` lines of an `INFO` reply.
    pub fn parse(text: &str) -> Self {
        let mut info = Self::default();
        for line in text.lines() {
            let line = line.trim();
            if line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once(':') else {
                continue;
            };
            match key {
                "used_memory" => info.used_memory = value.parse().ok(),
                "used_memory_human" => info.used_memory_human = Some(value.to_string()),
                "connected_clients" => info.connected_clients = value.parse().ok(),
                "redis_version" => info.redis_version = Some(value.to_string()),
                _ => {}
            }
        }
        info
    }
}

/// Redis-backed cache store over a [`ConnectionPool`].
#[derive(Debug, Clone)]
pub struct RedisCache {
    pool: ConnectionPool<RedisConnectionManager>,
    prefix: String,
}

impl RedisCache {
    /// Build the pool, open `min_connections`, and verify the server answers.
    pub async fn connect(config: PoolConfig, prefix: impl Into<String>) -> Result<Self> {
        Self::connect_with(config, prefix, None).await
    }

    /// Like [`connect`](Self::connect), reporting pool occupancy to `metrics`.
    pub async fn connect_with_metrics(
        config: PoolConfig,
        prefix: impl Into<String>,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Self> {
        Self::connect_with(config, prefix, Some(metrics)).await
    }

    async fn connect_with(
        config: PoolConfig,
        prefix: impl Into<String>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let manager = RedisConnectionManager::new(config.clone());
        let pool = match metrics {
            Some(metrics) => ConnectionPool::with_metrics(manager, config, metrics)?,
            None => ConnectionPool::new(manager, config)?,
        };
        pool.warm_up().await?;

        let cache = Self::from_pool(pool, prefix);
        let latency = cache.ping().await?;
        info!(prefix = %cache.prefix, latency = ?latency, "Redis cache connected");
        Ok(cache)
    }

    /// Wrap an existing pool.
    pub fn from_pool(pool: ConnectionPool<RedisConnectionManager>, prefix: impl Into<String>) -> Self {
        Self {
            pool,
            prefix: prefix.into(),
        }
    }

    pub fn pool(&self) -> &ConnectionPool<RedisConnectionManager> {
        &self.pool
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let key = namespaced(&self.prefix, key);
        self.pool
            .with_connection(|conn| {
                async move {
                    let value: Option<String> = redis::cmd("GET").arg(&key).query_async(conn).await?;
                    Ok::<_, RedisError>(value)
                }
                .boxed()
            })
            .await
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        let key = namespaced(&self.prefix, key);
        let value = value.to_string();
        self.pool
            .with_connection(|conn| {
                async move {
                    let mut cmd = redis::cmd("SET");
                    cmd.arg(&key).arg(&value);
                    if let Some(ttl) = ttl {
                        cmd.arg("PX").arg(ttl.as_millis().max(1) as u64);
                    }
                    let _: () = cmd.query_async(conn).await?;
                    Ok::<_, RedisError>(())
                }
                .boxed()
            })
            .await
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let key = namespaced(&self.prefix, key);
        self.pool
            .with_connection(|conn| {
                async move {
                    let deleted: u64 = redis::cmd("DEL").arg(&key).query_async(conn).await?;
                    Ok::<_, RedisError>(deleted > 0)
                }
                .boxed()
            })
            .await
    }

    async fn ping(&self) -> Result<Duration> {
        let mut conn = self.pool.acquire().await?;
        let started = Instant::now();
        let pinged = self.pool.manager().ping(&mut *conn).await;
        let latency = started.elapsed();
        match pinged {
            Ok(()) => Ok(latency),
            Err(e) => {
                if e.is_connection_error() {
                    self.pool.release_broken(conn).await;
                }
                Err(e)
            }
        }
    }

    async fn info(&self) -> Result<CacheInfo> {
        self.pool
            .with_connection(|conn| {
                async move {
                    let text: String = redis::cmd("INFO").query_async(conn).await?;
                    Ok::<_, RedisError>(CacheInfo::parse(&text))
                }
                .boxed()
            })
            .await
    }

    async fn close(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn is_connected(&self) -> bool {
        !self.pool.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_namespaced() {
        assert_eq!(namespaced("svc", "a"), "svc:a");
        assert_eq!(namespaced("", "a"), "a");
    }

    #[test]
    fn test_parse_info() {
        let text = "# Server\r\nredis_version:7.2.4\r\n\r\n# Clients\r\nconnected_clients:3\r\n# Memory\r\nused_memory:1048576\r\nused_memory_human:1.00M\r\n";
        let info = CacheInfo::parse(text);
        assert_eq!(info.redis_version.as_deref(), Some("7.2.4"));
        assert_eq!(info.connected_clients, Some(3));
        assert_eq!(info.used_memory, Some(1_048_576));
        assert_eq!(info.used_memory_human.as_deref(), Some("1.00M"));
    }

    #[tokio::test]
    async fn test_ping_unreachable_server_frees_slot() {
        let config = PoolConfig::builder()
            .nodes(vec!["redis://127.0.0.1:1".into()])
            .max_connections(1)
            .min_connections(0)
            .connect_timeout(Duration::from_millis(500))
            .acquire_timeout(Duration::from_millis(500))
            .build();
        let pool = ConnectionPool::new(RedisConnectionManager::new(config.clone()), config).unwrap();
        let cache = RedisCache::from_pool(pool, "test");

        assert!(cache.ping().await.is_err());
        let stats = cache.pool().stats();
        assert_eq!(stats.creating + stats.in_use + stats.idle, 0, "{stats:?}");
        assert!(cache.is_connected());
    }

    #[tokio::test]
    #[ignore = "requires a running Redis server"]
    async fn test_redis_round_trip() {
        let cache = RedisCache::connect(PoolConfig::default(), "meridian-test").await.unwrap();
        cache.set("k", "v", Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(cache.get("k").await.unwrap().as_deref(), Some("v"));
        assert!(cache.delete("k").await.unwrap());
        assert!(cache.info().await.unwrap().used_memory.is_some());
        cache.close().await.unwrap();
    }
}
