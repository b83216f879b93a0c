//! In-process cache store with TTL expiry, for local development and tests.

use crate::cache::{CacheInfo, CacheStore, namespaced};
use crate::error::{RedisError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;

struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.is_none_or(|at| now < at)
    }
}

/// A [`CacheStore`] kept in a process-local map.
pub struct MemoryCache {
    prefix: String,
    entries: Mutex<HashMap<String, Entry>>,
    connected: AtomicBool,
    available: AtomicBool,
}

impl MemoryCache {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            entries: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(true),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the server becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().values().filter(|e| e.is_live(now)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check(&self) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(RedisError::Connection("cache store is closed".into()));
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(RedisError::Connection("cache store unavailable".into()));
        }
        Ok(())
    }
}

impl std::fmt::Debug for MemoryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryCache")
            .field("prefix", &self.prefix)
            .field("keys", &self.entries.lock().len())
            .finish()
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        self.check()?;
        let key = namespaced(&self.prefix, key);
        let now = Instant::now();
        let mut entries = self.entries.lock();
        match entries.get(&key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(&key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<()> {
        self.check()?;
        let expires_at = ttl.map(|ttl| Instant::now() + ttl);
        self.entries.lock().insert(
            namespaced(&self.prefix, key),
            Entry {
                value: value.to_string(),
                expires_at,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        self.check()?;
        let now = Instant::now();
        Ok(self
            .entries
            .lock()
            .remove(&namespaced(&self.prefix, key))
            .is_some_and(|e| e.is_live(now)))
    }

    async fn ping(&self) -> Result<Duration> {
        self.check()?;
        Ok(Duration::ZERO)
    }

    async fn info(&self) -> Result<CacheInfo> {
        self.check()?;
        let entries = self.entries.lock();
        let used: usize = entries
            .iter()
            .map(|(k, e)| k.len() + e.value.len())
            .sum();
        Ok(CacheInfo {
            used_memory: Some(used as u64),
            used_memory_human: Some(format!("{}B", used)),
            connected_clients: Some(1),
            redis_version: None,
        })
    }

    async fn close(&self) -> Result<()> {
        self.connected.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn prefix(&self) -> &str {
        &self.prefix
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.available.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_set_get_delete() {
        let cache = MemoryCache::new("svc");
        cache.set("a", "1", None).await.unwrap();
        assert_eq!(cache.get("a").await.unwrap().as_deref(), Some("1"));
        assert!(cache.delete("a").await.unwrap());
        assert!(!cache.delete("a").await.unwrap());
        assert_eq!(cache.get("a").await.unwrap(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry() {
        let cache = MemoryCache::new("svc");
        cache
            .set("k", "v", Some(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(9)).await;
        assert!(cache.get("k").await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(cache.get("k").await.unwrap().is_none());
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_prefixes_isolate_stores() {
        let a = MemoryCache::new("a");
        a.set("k", "v", None).await.unwrap();
        assert!(a.entries.lock().contains_key("a:k"));
    }

    #[tokio::test]
    async fn test_unavailable_and_closed() {
        let cache = MemoryCache::new("svc");
        cache.set_available(false);
        assert!(cache.get("k").await.unwrap_err().is_connection_error());
        assert!(!cache.is_connected());

        cache.set_available(true);
        assert!(cache.ping().await.is_ok());

        cache.close().await.unwrap();
        assert!(cache.set("k", "v", None).await.is_err());
    }

    #[tokio::test]
    async fn test_info_reports_memory() {
        let cache = MemoryCache::new("");
        cache.set("key", "value", None).await.unwrap();
        let info = cache.info().await.unwrap();
        assert_eq!(info.used_memory, Some(8));
    }
}
