//! Bounded connection pool.
//!
//! Acquisition takes an idle connection if one exists, otherwise creates a
//! new one while below `max_connections` (rotating over the configured nodes),
//! otherwise queues the caller behind earlier waiters until a connection is
//! released or `acquire_timeout` elapses.
//!
//! Releasing hands the connection straight to the oldest live waiter. With no
//! waiters it goes idle, and when more than `min_connections` are idle an
//! eviction is scheduled for `idle_timeout` later. The eviction only closes the
//! connection if that exact idle stint is still current.
//!
//! The pool is the only owner of the connections it creates. A connection is
//! always in exactly one of: idle, in use, or being created, and
//! `idle + in_use + creating <= max_connections` holds under the state lock.

use crate::config::PoolConfig;
use crate::error::{RedisError, Result};
use async_trait::async_trait;
use futures::future::BoxFuture;
use meridian_metrics::MetricsRegistry;
use parking_lot::Mutex;
use redis::aio::MultiplexedConnection;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Creates, checks and closes connections for a [`ConnectionPool`].
#[async_trait]
pub trait ConnectionManager: Send + Sync + 'static {
    type Connection: Send + 'static;

    /// Open a connection to `node`.
    async fn connect(&self, node: &str) -> Result<Self::Connection>;

    /// Round-trip check on a live connection.
    async fn ping(&self, conn: &mut Self::Connection) -> Result<()>;

    /// Tear a connection down. Dropping it is enough for most clients.
    async fn close(&self, conn: Self::Connection) {
        drop(conn);
    }
}

/// Manager for multiplexed Redis connections.
#[derive(Debug, Clone)]
pub struct RedisConnectionManager {
    config: PoolConfig,
}

impl RedisConnectionManager {
    pub fn new(config: PoolConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ConnectionManager for RedisConnectionManager {
    type Connection = MultiplexedConnection;

    async fn connect(&self, node: &str) -> Result<MultiplexedConnection> {
        let client = redis::Client::open(self.config.node_url(node))
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        tokio::time::timeout(
            self.config.connect_timeout,
            client.get_multiplexed_async_connection(),
        )
        .await
        .map_err(|_| RedisError::Timeout)?
        .map_err(|e| RedisError::Connection(e.to_string()))
    }

    async fn ping(&self, conn: &mut MultiplexedConnection) -> Result<()> {
        let _: String = redis::cmd("PING")
            .query_async(conn)
            .await
            .map_err(|e| RedisError::Connection(e.to_string()))?;
        Ok(())
    }
}

/// Point-in-time pool occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub idle: usize,
    pub in_use: usize,
    pub creating: usize,
    pub waiting: usize,
    pub max: usize,
}

enum Grant<C> {
    Conn(u64, C),
    Failed(RedisError),
}

struct Waiter<C> {
    id: u64,
    tx: oneshot::Sender<Grant<C>>,
}

struct IdleEntry<C> {
    id: u64,
    conn: C,
    stint: u64,
}

struct PoolState<C> {
    idle: VecDeque<IdleEntry<C>>,
    in_use: HashSet<u64>,
    creating: usize,
    waiters: VecDeque<Waiter<C>>,
    next_id: u64,
    next_stint: u64,
    next_node: usize,
    closed: bool,
}

impl<C> PoolState<C> {
    fn total(&self) -> usize {
        self.idle.len() + self.in_use.len() + self.creating
    }

    /// Give `conn` to the oldest waiter still listening, or hand it back.
    fn hand_off(&mut self, id: u64, mut conn: C) -> Option<C> {
        while let Some(waiter) = self.waiters.pop_front() {
            match waiter.tx.send(Grant::Conn(id, conn)) {
                Ok(()) => return None,
                Err(Grant::Conn(_, returned)) => conn = returned,
                Err(Grant::Failed(_)) => return None,
            }
        }
        Some(conn)
    }
}

struct Shared<M: ConnectionManager> {
    manager: M,
    config: PoolConfig,
    state: Mutex<PoolState<M::Connection>>,
    metrics: Option<Arc<MetricsRegistry>>,
}

/// Fixed-capacity pool of cache-store connections.
pub struct ConnectionPool<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
}

impl<M: ConnectionManager> Clone for ConnectionPool<M> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

enum Next<C> {
    Ready(u64, C),
    Create(u64, String),
    Wait(u64, oneshot::Receiver<Grant<C>>),
}

impl<M: ConnectionManager> ConnectionPool<M> {
    /// Create an empty pool. Connections are opened on demand.
    pub fn new(manager: M, config: PoolConfig) -> Result<Self> {
        Self::build(manager, config, None)
    }

    /// Create a pool that reports occupancy and timeouts to `metrics`.
    pub fn with_metrics(manager: M, config: PoolConfig, metrics: Arc<MetricsRegistry>) -> Result<Self> {
        Self::build(manager, config, Some(metrics))
    }

    fn build(manager: M, config: PoolConfig, metrics: Option<Arc<MetricsRegistry>>) -> Result<Self> {
        config.validate()?;
        info!(
            pool = %config.name,
            nodes = config.nodes.len(),
            max_connections = config.max_connections,
            min_connections = config.min_connections,
            "Connection pool created"
        );
        Ok(Self {
            shared: Arc::new(Shared {
                manager,
                config,
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    in_use: HashSet::new(),
                    creating: 0,
                    waiters: VecDeque::new(),
                    next_id: 0,
                    next_stint: 0,
                    next_node: 0,
                    closed: false,
                }),
                metrics,
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.shared.config
    }

    pub fn manager(&self) -> &M {
        &self.shared.manager
    }

    /// Open connections until `min_connections` are idle.
    pub async fn warm_up(&self) -> Result<()> {
        let mut warmed = Vec::new();
        while self.stats().idle + warmed.len() < self.shared.config.min_connections {
            warmed.push(self.acquire().await?);
        }
        drop(warmed);
        Ok(())
    }

    /// Acquire a connection, waiting at most `acquire_timeout` when the pool is full.
    pub async fn acquire(&self) -> Result<PooledConnection<M>> {
        let next = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(RedisError::PoolClosing);
            }
            if let Some(entry) = state.idle.pop_back() {
                state.in_use.insert(entry.id);
                Next::Ready(entry.id, entry.conn)
            } else if state.total() < self.shared.config.max_connections {
                state.creating += 1;
                let id = state.next_id;
                state.next_id += 1;
                let nodes = &self.shared.config.nodes;
                let node = nodes[state.next_node % nodes.len()].clone();
                state.next_node = state.next_node.wrapping_add(1);
                Next::Create(id, node)
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_id;
                state.next_id += 1;
                state.waiters.push_back(Waiter { id, tx });
                Next::Wait(id, rx)
            }
        };

        let result = match next {
            Next::Ready(id, conn) => Ok(self.lease(id, conn)),
            Next::Create(id, node) => self.create(id, &node).await,
            Next::Wait(id, rx) => self.wait(id, rx).await,
        };
        self.report();
        result
    }

    async fn create(&self, id: u64, node: &str) -> Result<PooledConnection<M>> {
        debug!(pool = %self.shared.config.name, node = %node, "Opening connection");
        let mut slot = Creating {
            shared: &self.shared,
            armed: true,
        };
        let created = self.shared.manager.connect(node).await;
        slot.armed = false;

        let (closed, replace) = {
            let mut state = self.shared.state.lock();
            state.creating -= 1;
            if created.is_ok() && !state.closed {
                state.in_use.insert(id);
            }
            (state.closed, !state.waiters.is_empty())
        };

        match created {
            Ok(conn) if closed => {
                self.shared.manager.close(conn).await;
                Err(RedisError::PoolClosing)
            }
            Ok(conn) => Ok(self.lease(id, conn)),
            Err(e) => {
                warn!(pool = %self.shared.config.name, node = %node, error = %e, "Failed to open connection");
                if replace {
                    Shared::spawn_replacement(&self.shared);
                }
                Err(e)
            }
        }
    }

    async fn wait(&self, id: u64, rx: oneshot::Receiver<Grant<M::Connection>>) -> Result<PooledConnection<M>> {
        let mut waiting = Waiting {
            shared: &self.shared,
            id,
            rx: Some(rx),
        };
        let timeout = self.shared.config.acquire_timeout;

        let outcome = match waiting.rx.as_mut() {
            Some(rx) => tokio::time::timeout(timeout, rx).await,
            None => return Err(RedisError::PoolClosing),
        };

        match outcome {
            Ok(Ok(Grant::Conn(id, conn))) => {
                waiting.rx = None;
                Ok(self.lease(id, conn))
            }
            Ok(Ok(Grant::Failed(e))) => {
                waiting.rx = None;
                Err(e)
            }
            Ok(Err(_)) => {
                waiting.rx = None;
                Err(RedisError::PoolClosing)
            }
            Err(_) => match waiting.abandon() {
                Some(Grant::Conn(id, conn)) => Ok(self.lease(id, conn)),
                Some(Grant::Failed(e)) => Err(e),
                None => {
                    warn!(
                        pool = %self.shared.config.name,
                        timeout = ?timeout,
                        "Timed out waiting for a pooled connection"
                    );
                    if let Some(metrics) = &self.shared.metrics {
                        metrics.record_pool_timeout(&self.shared.config.name);
                    }
                    Err(RedisError::AcquireTimeout(timeout))
                }
            },
        }
    }

    fn lease(&self, id: u64, conn: M::Connection) -> PooledConnection<M> {
        PooledConnection {
            shared: self.shared.clone(),
            id,
            conn: Some(conn),
        }
    }

    /// Return a connection to the pool. Same as dropping it.
    pub fn release(&self, conn: PooledConnection<M>) {
        drop(conn);
    }

    /// Return a connection known to be unusable; it is closed instead of reused.
    pub async fn release_broken(&self, mut conn: PooledConnection<M>) {
        let Some(inner) = conn.conn.take() else {
            return;
        };
        let replace = {
            let mut state = self.shared.state.lock();
            state.in_use.remove(&conn.id);
            !state.closed && !state.waiters.is_empty()
        };
        debug!(pool = %self.shared.config.name, id = conn.id, "Closing broken connection");
        self.shared.manager.close(inner).await;
        if replace {
            Shared::spawn_replacement(&self.shared);
        }
        self.report();
    }

    /// Acquire, run `op`, and release whatever the outcome.
    pub async fn with_connection<F, T, E>(&self, op: F) -> std::result::Result<T, E>
    where
        F: for<'c> FnOnce(&'c mut M::Connection) -> BoxFuture<'c, std::result::Result<T, E>>,
        E: From<RedisError>,
    {
        let mut conn = self.acquire().await?;
        let result = op(&mut *conn).await;
        drop(conn);
        result
    }

    /// Close every idle connection, fail all waiters, and refuse new
    /// acquisitions. Connections still in use are closed as they come back.
    pub async fn close(&self) {
        let (idle, waiters) = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            (
                std::mem::take(&mut state.idle),
                std::mem::take(&mut state.waiters),
            )
        };

        info!(
            pool = %self.shared.config.name,
            idle = idle.len(),
            waiters = waiters.len(),
            "Connection pool closing"
        );

        for waiter in waiters {
            let _ = waiter.tx.send(Grant::Failed(RedisError::PoolClosing));
        }
        for entry in idle {
            self.shared.manager.close(entry.conn).await;
        }
        self.report();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    pub fn stats(&self) -> PoolStats {
        self.shared.stats()
    }

    fn report(&self) {
        self.shared.report();
    }
}

impl<M: ConnectionManager> Shared<M> {
    fn stats(&self) -> PoolStats {
        let state = self.state.lock();
        PoolStats {
            idle: state.idle.len(),
            in_use: state.in_use.len(),
            creating: state.creating,
            waiting: state.waiters.len(),
            max: self.config.max_connections,
        }
    }

    fn report(&self) {
        if let Some(metrics) = &self.metrics {
            let stats = self.stats();
            metrics.record_pool(&self.config.name, stats.idle, stats.in_use, stats.waiting);
        }
    }

    fn release(self: &Arc<Self>, id: u64, conn: M::Connection) {
        let mut state = self.state.lock();

        if state.closed {
            state.in_use.remove(&id);
            drop(state);
            self.spawn_close(conn);
            return;
        }

        let Some(conn) = state.hand_off(id, conn) else {
            drop(state);
            self.report();
            return;
        };

        state.in_use.remove(&id);
        let stint = state.next_stint;
        state.next_stint += 1;
        state.idle.push_back(IdleEntry { id, conn, stint });
        let surplus = state.idle.len() > self.config.min_connections;
        drop(state);

        if surplus {
            self.schedule_eviction(id, stint);
        }
        self.report();
    }

    fn schedule_eviction(self: &Arc<Self>, id: u64, stint: u64) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let weak: Weak<Self> = Arc::downgrade(self);
        let idle_timeout = self.config.idle_timeout;

        handle.spawn(async move {
            tokio::time::sleep(idle_timeout).await;
            let Some(shared) = weak.upgrade() else { return };

            let evicted = {
                let mut state = shared.state.lock();
                if state.closed || state.idle.len() <= shared.config.min_connections {
                    None
                } else {
                    state
                        .idle
                        .iter()
                        .position(|e| e.id == id && e.stint == stint)
                        .and_then(|pos| state.idle.remove(pos))
                }
            };

            if let Some(entry) = evicted {
                debug!(pool = %shared.config.name, id = entry.id, "Evicting idle connection");
                shared.manager.close(entry.conn).await;
                shared.report();
            }
        });
    }

    /// Open a connection on behalf of queued waiters after capacity was freed
    /// without a connection to hand over.
    fn spawn_replacement(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };

        let (id, node) = {
            let mut state = self.state.lock();
            if state.closed || state.waiters.is_empty() || state.total() >= self.config.max_connections {
                return;
            }
            state.creating += 1;
            let id = state.next_id;
            state.next_id += 1;
            let node = self.config.nodes[state.next_node % self.config.nodes.len()].clone();
            state.next_node = state.next_node.wrapping_add(1);
            (id, node)
        };

        let shared = self.clone();
        handle.spawn(async move {
            let created = shared.manager.connect(&node).await;
            let mut state = shared.state.lock();
            state.creating -= 1;
            match created {
                Ok(conn) => {
                    state.in_use.insert(id);
                    drop(state);
                    shared.release(id, conn);
                }
                Err(e) => {
                    if let Some(waiter) = state.waiters.pop_front() {
                        let _ = waiter.tx.send(Grant::Failed(e));
                    }
                }
            }
        });
    }

    fn spawn_close(self: &Arc<Self>, conn: M::Connection) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let shared = self.clone();
                handle.spawn(async move { shared.manager.close(conn).await });
            }
            Err(_) => drop(conn),
        }
    }
}

/// Capacity reserved for a connection being opened. Dropped while still
/// armed, the acquisition was cancelled mid-connect and the slot is returned.
struct Creating<'a, M: ConnectionManager> {
    shared: &'a Arc<Shared<M>>,
    armed: bool,
}

impl<M: ConnectionManager> Drop for Creating<'_, M> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let replace = {
            let mut state = self.shared.state.lock();
            state.creating -= 1;
            !state.closed && !state.waiters.is_empty()
        };
        debug!(pool = %self.shared.config.name, "Connection attempt abandoned");
        if replace {
            Shared::spawn_replacement(self.shared);
        }
        self.shared.report();
    }
}

/// Queued acquisition. Dropping it unqueues the waiter, or returns a
/// connection that was granted after the caller stopped listening.
struct Waiting<'a, M: ConnectionManager> {
    shared: &'a Arc<Shared<M>>,
    id: u64,
    rx: Option<oneshot::Receiver<Grant<M::Connection>>>,
}

impl<M: ConnectionManager> Waiting<'_, M> {
    fn abandon(&mut self) -> Option<Grant<M::Connection>> {
        let mut rx = self.rx.take()?;
        let mut state = self.shared.state.lock();
        if let Some(pos) = state.waiters.iter().position(|w| w.id == self.id) {
            state.waiters.remove(pos);
            return None;
        }
        drop(state);
        rx.try_recv().ok()
    }
}

impl<M: ConnectionManager> Drop for Waiting<'_, M> {
    fn drop(&mut self) {
        if let Some(Grant::Conn(id, conn)) = self.abandon() {
            self.shared.release(id, conn);
        }
    }
}

/// A connection checked out of a [`ConnectionPool`]; returned on drop.
pub struct PooledConnection<M: ConnectionManager> {
    shared: Arc<Shared<M>>,
    id: u64,
    conn: Option<M::Connection>,
}

impl<M: ConnectionManager> Deref for PooledConnection<M> {
    type Target = M::Connection;

    fn deref(&self) -> &Self::Target {
        self.conn.as_ref().expect("connection already released")
    }
}

impl<M: ConnectionManager> DerefMut for PooledConnection<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.conn.as_mut().expect("connection already released")
    }
}

impl<M: ConnectionManager> Drop for PooledConnection<M> {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, conn);
        }
    }
}

impl<M: ConnectionManager> fmt::Debug for PooledConnection<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("pool", &self.shared.config.name)
            .field("id", &self.id)
            .finish()
    }
}

impl<M: ConnectionManager> fmt::Debug for ConnectionPool<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("name", &self.shared.config.name)
            .field("stats", &self.stats())
            .finish()
    }
}
