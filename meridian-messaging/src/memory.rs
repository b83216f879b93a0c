//! In-process broker with AMQP-style routing, for local development and tests.
//!
//! Exchanges route by kind (direct, topic with `*`/`#` patterns, fanout),
//! the default exchange `""` routes to the queue named by the routing key,
//! and queues apply their retry and dead-letter policy to rejected deliveries.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use async_trait::async_trait;
use futures::stream;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, ExchangeKind, QueueConfig};
use crate::error::MessagingError;
use crate::message::{
    ConsumeOptions, DEATH_QUEUE_HEADER, Delivery, OutboundMessage, QueueStatus, RETRY_COUNT_HEADER,
};
use crate::traits::{BrokerChannel, MessageStream};

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    body: Vec<u8>,
    headers: HashMap<String, String>,
    message_id: Option<String>,
    correlation_id: Option<String>,
    redelivered: bool,
}

impl StoredMessage {
    fn to_delivery(&self, delivery_tag: u64) -> Delivery {
        Delivery {
            delivery_tag,
            exchange: self.exchange.clone(),
            routing_key: self.routing_key.clone(),
            body: self.body.clone(),
            headers: self.headers.clone(),
            message_id: self.message_id.clone(),
            correlation_id: self.correlation_id.clone(),
            redelivered: self.redelivered,
        }
    }

    fn retry_count(&self) -> u32 {
        self.headers
            .get(RETRY_COUNT_HEADER)
            .and_then(|v| v.parse().ok())
            .unwrap_or(0)
    }
}

struct QueueState {
    config: QueueConfig,
    ready: VecDeque<StoredMessage>,
    consumers: u32,
    notify: Arc<Notify>,
}

struct Binding {
    queue: String,
    exchange: String,
    routing_key: String,
}

struct Consumer {
    channel: u64,
    queue: String,
    prefetch: Option<u16>,
}

struct Unacked {
    channel: u64,
    consumer: Option<String>,
    queue: String,
    message: StoredMessage,
}

#[derive(Default)]
struct BrokerState {
    exchanges: HashMap<String, ExchangeConfig>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    consumers: HashMap<String, Consumer>,
    unacked: HashMap<u64, Unacked>,
    next_delivery_tag: u64,
}

impl BrokerState {
    /// Push `message` onto every queue `exchange` routes `routing_key` to.
    fn route(
        &mut self,
        exchange: &str,
        routing_key: &str,
        message: StoredMessage,
    ) -> Result<usize, MessagingError> {
        let mut targets: Vec<String> = if exchange.is_empty() {
            self.queues
                .contains_key(routing_key)
                .then(|| routing_key.to_string())
                .into_iter()
                .collect()
        } else {
            let kind = self
                .exchanges
                .get(exchange)
                .map(|e| e.kind)
                .ok_or_else(|| MessagingError::NotFound(format!("exchange '{}'", exchange)))?;
            self.bindings
                .iter()
                .filter(|b| b.exchange == exchange && binding_matches(kind, &b.routing_key, routing_key))
                .map(|b| b.queue.clone())
                .collect()
        };
        targets.sort();
        targets.dedup();

        for name in &targets {
            if let Some(queue) = self.queues.get_mut(name) {
                queue.ready.push_back(message.clone());
                queue.notify.notify_waiters();
            }
        }
        Ok(targets.len())
    }

    fn remove_consumer(&mut self, tag: &str) -> Option<Consumer> {
        let consumer = self.consumers.remove(tag)?;
        let mut delete = false;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            queue.consumers = queue.consumers.saturating_sub(1);
            queue.notify.notify_waiters();
            delete = queue.config.auto_delete && queue.consumers == 0;
        }
        if delete {
            debug!(queue = %consumer.queue, "Auto-delete queue removed");
            self.queues.remove(&consumer.queue);
            self.bindings.retain(|b| b.queue != consumer.queue);
        }
        Some(consumer)
    }

    fn requeue_front(&mut self, queue: &str, mut message: StoredMessage) {
        message.redelivered = true;
        if let Some(q) = self.queues.get_mut(queue) {
            q.ready.push_front(message);
            q.notify.notify_waiters();
        }
    }

    fn wake(&self, queue: &str) {
        if let Some(q) = self.queues.get(queue) {
            q.notify.notify_waiters();
        }
    }
}

fn binding_matches(kind: ExchangeKind, pattern: &str, routing_key: &str) -> bool {
    match kind {
        ExchangeKind::Direct => pattern == routing_key,
        ExchangeKind::Fanout => true,
        ExchangeKind::Topic => topic_matches(pattern, routing_key),
    }
}

/// Match a dot-separated routing key against a topic pattern, where `*`
/// stands for exactly one word and `#` for zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    words_match(&pattern, &key)
}

fn words_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.split_first() {
        None => key.is_empty(),
        Some((&"#", rest)) => (0..=key.len()).any(|skip| words_match(rest, &key[skip..])),
        Some((&"*", rest)) => !key.is_empty() && words_match(rest, &key[1..]),
        Some((word, rest)) => key.first() == Some(word) && words_match(rest, &key[1..]),
    }
}

struct Shared {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    failing_confirms: AtomicU32,
    next_channel: AtomicU64,
}

impl Shared {
    /// Apply the queue's policy to a delivery rejected without requeue.
    fn reject(self: &Arc<Self>, state: &mut BrokerState, queue: &str, mut message: StoredMessage) {
        let Some(config) = state.queues.get(queue).map(|q| q.config.clone()) else {
            debug!(queue, "Rejected message discarded, queue no longer exists");
            return;
        };

        let retries = message.retry_count();
        if retries < config.max_retries {
            message
                .headers
                .insert(RETRY_COUNT_HEADER.to_string(), (retries + 1).to_string());
            message.redelivered = true;
            debug!(queue, attempt = retries + 1, delay = ?config.retry_delay, "Scheduling redelivery");

            if config.retry_delay.is_zero() {
                if let Some(q) = state.queues.get_mut(queue) {
                    q.ready.push_back(message);
                    q.notify.notify_waiters();
                }
                return;
            }

            let weak = Arc::downgrade(self);
            let queue = queue.to_string();
            let due = tokio::time::Instant::now() + config.retry_delay;
            tokio::spawn(async move {
                tokio::time::sleep_until(due).await;
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                let mut state = shared.state.lock();
                if let Some(q) = state.queues.get_mut(&queue) {
                    q.ready.push_back(message);
                    q.notify.notify_waiters();
                }
            });
            return;
        }

        let Some(dlx) = config.dead_letter_exchange else {
            warn!(queue, retries, "Rejected message discarded, no dead-letter exchange");
            return;
        };
        let routing_key = config
            .dead_letter_routing_key
            .unwrap_or_else(|| message.routing_key.clone());
        message
            .headers
            .insert(DEATH_QUEUE_HEADER.to_string(), queue.to_string());

        match state.route(&dlx, &routing_key, message) {
            Ok(0) => warn!(queue, exchange = %dlx, "Dead-lettered message was unroutable"),
            Ok(_) => info!(queue, exchange = %dlx, retries, "Message dead-lettered"),
            Err(e) => warn!(queue, error = %e, "Dead-lettering failed"),
        }
    }
}

/// An in-process broker. Clones share the same exchanges and queues.
#[derive(Clone)]
pub struct MemoryBroker {
    shared: Arc<Shared>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                failing_confirms: AtomicU32::new(0),
                next_channel: AtomicU64::new(1),
            }),
        }
    }

    /// Open a channel on this broker.
    pub fn channel(&self) -> MemoryChannel {
        MemoryChannel {
            id: self.shared.next_channel.fetch_add(1, Ordering::Relaxed),
            shared: Arc::clone(&self.shared),
            open: AtomicBool::new(true),
        }
    }

    /// Simulate the broker becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.shared.available.store(available, Ordering::SeqCst);
        if available {
            let state = self.shared.state.lock();
            for queue in state.queues.values() {
                queue.notify.notify_waiters();
            }
        }
    }

    /// Make the next `rounds` confirm waits fail.
    pub fn fail_confirms(&self, rounds: u32) {
        self.shared.failing_confirms.store(rounds, Ordering::SeqCst);
    }

    /// Take the next ready message off `queue` without a consumer (auto-ack).
    pub fn get(&self, queue: &str) -> Option<Delivery> {
        let mut state = self.shared.state.lock();
        let message = state.queues.get_mut(queue)?.ready.pop_front()?;
        Some(message.to_delivery(0))
    }

    /// Messages ready on `queue`; zero when it does not exist.
    pub fn depth(&self, queue: &str) -> usize {
        let state = self.shared.state.lock();
        state.queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries handed to consumers and not yet acknowledged.
    pub fn unacked(&self) -> usize {
        self.shared.state.lock().unacked.len()
    }

    pub fn queue_exists(&self, queue: &str) -> bool {
        self.shared.state.lock().queues.contains_key(queue)
    }
}

impl fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.shared.state.lock();
        f.debug_struct("MemoryBroker")
            .field("exchanges", &state.exchanges.len())
            .field("queues", &state.queues.len())
            .field("unacked", &state.unacked.len())
            .finish()
    }
}

/// A channel on a [`MemoryBroker`].
pub struct MemoryChannel {
    id: u64,
    shared: Arc<Shared>,
    open: AtomicBool,
}

impl MemoryChannel {
    fn check(&self) -> Result<(), MessagingError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(MessagingError::ChannelClosed("channel is closed".into()));
        }
        if !self.shared.available.load(Ordering::SeqCst) {
            return Err(MessagingError::Connection("broker unavailable".into()));
        }
        Ok(())
    }

    fn take_unacked(&self, delivery_tag: u64) -> Result<(BrokerGuard<'_>, Unacked), MessagingError> {
        let mut state = self.shared.state.lock();
        match state.unacked.remove(&delivery_tag) {
            Some(entry) if entry.channel == self.id => Ok((state, entry)),
            other => {
                if let Some(entry) = other {
                    state.unacked.insert(delivery_tag, entry);
                }
                Err(MessagingError::Acknowledge(format!(
                    "unknown delivery tag {}",
                    delivery_tag
                )))
            }
        }
    }
}

type BrokerGuard<'a> = parking_lot::MutexGuard<'a, BrokerState>;

impl fmt::Debug for MemoryChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryChannel")
            .field("id", &self.id)
            .field("open", &self.open.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, config: &ExchangeConfig) -> Result<(), MessagingError> {
        self.check()?;
        let mut state = self.shared.state.lock();
        if let Some(existing) = state.exchanges.get(&config.name) {
            if existing.kind != config.kind {
                return Err(MessagingError::BrokerError(format!(
                    "exchange '{}' already declared as {:?}",
                    config.name, existing.kind
                )));
            }
            return Ok(());
        }
        state.exchanges.insert(config.name.clone(), config.clone());
        debug!(exchange = %config.name, kind = ?config.kind, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, config: &QueueConfig) -> Result<(), MessagingError> {
        self.check()?;
        let mut state = self.shared.state.lock();
        if !state.queues.contains_key(&config.name) {
            state.queues.insert(
                config.name.clone(),
                QueueState {
                    config: config.clone(),
                    ready: VecDeque::new(),
                    consumers: 0,
                    notify: Arc::new(Notify::new()),
                },
            );
            debug!(queue = %config.name, "Queue declared");
        }
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.check()?;
        let mut state = self.shared.state.lock();
        if !state.exchanges.contains_key(exchange) {
            return Err(MessagingError::NotFound(format!("exchange '{}'", exchange)));
        }
        if !state.queues.contains_key(queue) {
            return Err(MessagingError::NotFound(format!("queue '{}'", queue)));
        }
        let exists = state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.exchange == exchange && b.routing_key == routing_key);
        if !exists {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        debug!(queue, exchange, routing_key, "Queue bound to exchange");
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.check()?;
        let mut state = self.shared.state.lock();
        state
            .bindings
            .retain(|b| !(b.queue == queue && b.exchange == exchange && b.routing_key == routing_key));
        debug!(queue, exchange, routing_key, "Queue unbound from exchange");
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), MessagingError> {
        self.check()?;
        let stored = StoredMessage {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            body: message.body.clone(),
            headers: message.headers.clone(),
            message_id: Some(message.message_id.clone()),
            correlation_id: message.correlation_id.clone(),
            redelivered: false,
        };
        let routed = self
            .shared
            .state
            .lock()
            .route(&message.exchange, &message.routing_key, stored)
            .map_err(|e| MessagingError::Publish(e.to_string()))?;

        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            queues = routed,
            "Publishing message"
        );
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<(), MessagingError> {
        self.check()?;
        let failed = self
            .shared
            .failing_confirms
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(MessagingError::Confirm(
                "broker negatively acknowledged published messages".into(),
            ));
        }
        Ok(())
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<MessageStream, MessagingError> {
        self.check()?;
        {
            let mut state = self.shared.state.lock();
            if state.consumers.contains_key(&options.consumer_tag) {
                return Err(MessagingError::Subscribe(format!(
                    "consumer tag '{}' already in use",
                    options.consumer_tag
                )));
            }
            let queue = state
                .queues
                .get_mut(&options.queue)
                .ok_or_else(|| MessagingError::NotFound(format!("queue '{}'", options.queue)))?;
            queue.consumers += 1;
            state.consumers.insert(
                options.consumer_tag.clone(),
                Consumer {
                    channel: self.id,
                    queue: options.queue.clone(),
                    prefetch: options.prefetch,
                },
            );
        }
        info!(queue = %options.queue, consumer_tag = %options.consumer_tag, "Consumer started");

        let cursor = Cursor {
            shared: Arc::clone(&self.shared),
            channel: self.id,
            queue: options.queue,
            tag: options.consumer_tag,
        };
        Ok(Box::pin(stream::unfold(cursor, |cursor| async move {
            let delivery = cursor.next().await?;
            Some((Ok::<_, MessagingError>(delivery), cursor))
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        let removed = self.shared.state.lock().remove_consumer(consumer_tag);
        if removed.is_some() {
            info!(consumer_tag, "Consumer cancelled");
        }
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.check()?;
        let (state, entry) = self.take_unacked(delivery_tag)?;
        state.wake(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        self.check()?;
        let (mut state, entry) = self.take_unacked(delivery_tag)?;
        if requeue {
            state.requeue_front(&entry.queue, entry.message);
        } else {
            self.shared.reject(&mut state, &entry.queue, entry.message);
            state.wake(&entry.queue);
        }
        Ok(())
    }

    async fn queue_status(&self, queue: &str) -> Result<QueueStatus, MessagingError> {
        self.check()?;
        let state = self.shared.state.lock();
        let q = state
            .queues
            .get(queue)
            .ok_or_else(|| MessagingError::NotFound(format!("queue '{}'", queue)))?;
        Ok(QueueStatus {
            name: queue.to_string(),
            message_count: q.ready.len() as u64,
            consumer_count: q.consumers,
        })
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, MessagingError> {
        self.check()?;
        Ok(exchange.is_empty() || self.shared.state.lock().exchanges.contains_key(exchange))
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst) && self.shared.available.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<(), MessagingError> {
        if !self.open.swap(false, Ordering::SeqCst) {
            return Ok(());
        }

        let mut state = self.shared.state.lock();
        let tags: Vec<String> = state
            .consumers
            .iter()
            .filter(|(_, c)| c.channel == self.id)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in &tags {
            state.remove_consumer(tag);
        }

        let mut pending: Vec<u64> = state
            .unacked
            .iter()
            .filter(|(_, u)| u.channel == self.id)
            .map(|(tag, _)| *tag)
            .collect();
        // Requeue in reverse so the oldest delivery ends up at the head.
        pending.sort_unstable_by(|a, b| b.cmp(a));
        for tag in pending {
            if let Some(entry) = state.unacked.remove(&tag) {
                state.requeue_front(&entry.queue, entry.message);
            }
        }

        info!(channel = self.id, consumers = tags.len(), "Channel closed");
        Ok(())
    }
}

enum Take {
    Delivery(Delivery),
    Empty,
    Cancelled,
}

/// A consumer's position on its queue.
struct Cursor {
    shared: Arc<Shared>,
    channel: u64,
    queue: String,
    tag: String,
}

impl Cursor {
    async fn next(&self) -> Option<Delivery> {
        loop {
            let notify = {
                let state = self.shared.state.lock();
                if !state.consumers.contains_key(&self.tag) {
                    return None;
                }
                Arc::clone(&state.queues.get(&self.queue)?.notify)
            };

            // Register for wake-ups before looking, so a publish in between is not missed.
            let notified = notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.take() {
                Take::Delivery(delivery) => return Some(delivery),
                Take::Cancelled => return None,
                Take::Empty => notified.await,
            }
        }
    }

    fn take(&self) -> Take {
        let mut state = self.shared.state.lock();
        let Some(consumer) = state.consumers.get(&self.tag) else {
            return Take::Cancelled;
        };
        if !self.shared.available.load(Ordering::SeqCst) {
            return Take::Empty;
        }
        if let Some(prefetch) = consumer.prefetch {
            let held = state
                .unacked
                .values()
                .filter(|u| u.consumer.as_deref() == Some(self.tag.as_str()))
                .count();
            if held >= prefetch as usize {
                return Take::Empty;
            }
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Take::Cancelled;
        };
        let Some(message) = queue.ready.pop_front() else {
            return Take::Empty;
        };

        state.next_delivery_tag += 1;
        let delivery_tag = state.next_delivery_tag;
        let delivery = message.to_delivery(delivery_tag);
        state.unacked.insert(
            delivery_tag,
            Unacked {
                channel: self.channel,
                consumer: Some(self.tag.clone()),
                queue: self.queue.clone(),
                message,
            },
        );
        Take::Delivery(delivery)
    }
}
