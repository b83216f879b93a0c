//! # Meridian Redis
//!
//! Bounded connection pooling and the cache store boundary used by the event
//! bus for de-duplication.
//!
//! ## Features
//!
//! - **Connection Pool**: fixed capacity, FIFO waiters with a deadline,
//!   direct hand-off on release, idle eviction above a minimum
//! - **Round-robin nodes**: new connections rotate over the configured nodes
//! - **Cache Store**: prefixed `GET`/`SET`/`DEL`/`PING`/`INFO` over Redis, or
//!   in memory for development and tests
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use meridian_redis::{CacheStore, PoolConfig, RedisCache};
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = PoolConfig::from_env().max_connections(8).build();
//!     let cache = RedisCache::connect(config, "billing").await?;
//!
//!     cache.set("invoice:42", "sent", Some(Duration::from_secs(60))).await?;
//!     let latency = cache.ping().await?;
//!     println!("redis answered in {latency:?}");
//!
//!     cache.close().await?;
//!     Ok(())
//! }
//! ```
//!
//! The in-memory store has the same interface:
//!
//! ```rust
//! use meridian_redis::{CacheStore, MemoryCache};
//!
//! # tokio_test::block_on(async {
//! let cache = MemoryCache::new("billing");
//! cache.set("invoice:42", "sent", None).await.unwrap();
//! assert_eq!(cache.get("invoice:42").await.unwrap().as_deref(), Some("sent"));
//! assert!(cache.delete("invoice:42").await.unwrap());
//! # });
//! ```

mod cache;
mod config;
mod error;
mod memory;
mod pool;

pub use cache::{CacheInfo, CacheStore, RedisCache, namespaced};
pub use config::{PoolConfig, PoolConfigBuilder};
pub use error::{RedisError, Result};
pub use memory::MemoryCache;
pub use pool::{
    ConnectionManager, ConnectionPool, PoolStats, PooledConnection, RedisConnectionManager,
};

// Re-export redis crate for convenience
pub use redis;
