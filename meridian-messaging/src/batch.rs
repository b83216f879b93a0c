//! Buffered publishing with whole-batch confirmation.
//!
//! Items are buffered until `batch_size` is reached or `flush_interval`
//! elapses, then published in insertion order and confirmed as one unit.
//! A batch whose confirmation fails is retried as a whole with linear
//! backoff; it is never partially drained. A flush cancelled mid-publish
//! puts its batch back at the head of the buffer.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::BoxFuture;
use meridian_metrics::MetricsRegistry;
use meridian_resilience::Backoff;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::duration_secs;
use crate::error::{BatchError, MessagingError};
use crate::message::{BATCH_ID_HEADER, BATCH_SIZE_HEADER, OutboundMessage};
use crate::traits::BrokerChannel;

/// Whole-batch retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Delay before retry `n` is `retry_delay * n`
    #[serde(with = "duration_secs")]
    pub retry_delay: Duration,
}

/// Batch publisher configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// Exchange every item is published to
    pub exchange: String,
    /// Pending items that trigger a flush
    pub batch_size: usize,
    /// Maximum time an item waits before a timed flush
    #[serde(with = "duration_secs")]
    pub flush_interval: Duration,
    /// Pending items beyond which `add` is refused
    pub max_buffer: usize,
    /// Bound on each wait for publisher confirms
    #[serde(with = "duration_secs")]
    pub confirm_timeout: Duration,
    /// `None` keeps a failed batch buffered for the next flush instead of retrying
    pub retry: Option<BatchRetryPolicy>,
}

impl BatchConfig {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            batch_size: 100,
            flush_interval: Duration::from_secs(1),
            max_buffer: 10_000,
            confirm_timeout: Duration::from_secs(5),
            retry: Some(BatchRetryPolicy {
                max_retries: 3,
                retry_delay: Duration::from_secs(1),
            }),
        }
    }

    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn max_buffer(mut self, max: usize) -> Self {
        self.max_buffer = max;
        self
    }

    pub fn confirm_timeout(mut self, timeout: Duration) -> Self {
        self.confirm_timeout = timeout;
        self
    }

    /// Retry a failed batch up to `max_retries` times with linear backoff.
    pub fn retry(mut self, max_retries: u32, retry_delay: Duration) -> Self {
        self.retry = Some(BatchRetryPolicy {
            max_retries,
            retry_delay,
        });
        self
    }

    /// Keep failed batches buffered instead of retrying and dropping them.
    pub fn without_retry(mut self) -> Self {
        self.retry = None;
        self
    }

    pub fn validate(&self) -> Result<(), MessagingError> {
        if self.batch_size == 0 {
            return Err(MessagingError::Configuration(
                "batch_size must be at least 1".into(),
            ));
        }
        if self.max_buffer < self.batch_size {
            return Err(MessagingError::Configuration(format!(
                "max_buffer ({}) is smaller than batch_size ({})",
                self.max_buffer, self.batch_size
            )));
        }
        if self.flush_interval.is_zero() || self.confirm_timeout.is_zero() {
            return Err(MessagingError::Configuration(
                "flush_interval and confirm_timeout must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// One buffered message
#[derive(Debug, Clone, PartialEq)]
pub struct BatchItem {
    pub routing_key: String,
    pub body: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub message_id: String,
    pub correlation_id: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
}

impl BatchItem {
    pub fn new(routing_key: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            routing_key: routing_key.into(),
            body: body.into(),
            headers: HashMap::new(),
            message_id: Uuid::new_v4().to_string(),
            correlation_id: None,
            content_type: None,
            persistent: true,
        }
    }

    /// Create an item from a JSON-serializable value
    pub fn json<T: Serialize>(
        routing_key: impl Into<String>,
        value: &T,
    ) -> Result<Self, MessagingError> {
        let body =
            serde_json::to_vec(value).map_err(|e| MessagingError::Serialization(e.to_string()))?;
        let mut item = Self::new(routing_key, body);
        item.content_type = Some("application/json".to_string());
        Ok(item)
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }

    fn to_message(&self, exchange: &str, batch_id: &str, batch_size: usize) -> OutboundMessage {
        let mut message = OutboundMessage::new(exchange, self.routing_key.clone(), self.body.clone());
        message.headers = self.headers.clone();
        message.message_id = self.message_id.clone();
        message.correlation_id = self.correlation_id.clone();
        message.content_type = self.content_type.clone();
        message.persistent = self.persistent;
        message
            .with_header(BATCH_ID_HEADER, batch_id)
            .with_header(BATCH_SIZE_HEADER, batch_size.to_string())
    }
}

/// Counters kept by a [`BatchPublisher`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchStats {
    /// Batches published and confirmed
    pub flushes: u64,
    /// Flushes that ended in an error (after any retries)
    pub failed_flushes: u64,
    pub items_published: u64,
    pub items_dropped: u64,
}

/// Callback receiving the items of a batch dropped after its retries.
pub type DroppedBatchHook = Arc<dyn Fn(Vec<BatchItem>) -> BoxFuture<'static, ()> + Send + Sync>;

/// Buffers outbound messages and flushes them through a broker channel.
pub struct BatchPublisher {
    config: BatchConfig,
    channel: Arc<dyn BrokerChannel>,
    metrics: Option<Arc<MetricsRegistry>>,
    buffer: Mutex<VecDeque<BatchItem>>,
    flush_lock: tokio::sync::Mutex<()>,
    closed: AtomicBool,
    shutdown: Arc<Notify>,
    timer: Mutex<Option<JoinHandle<()>>>,
    dropped_hook: Mutex<Option<DroppedBatchHook>>,
    flushes: AtomicU64,
    failed_flushes: AtomicU64,
    items_published: AtomicU64,
    items_dropped: AtomicU64,
}

impl BatchPublisher {
    /// Create a publisher and start its flush timer.
    pub fn new(
        channel: Arc<dyn BrokerChannel>,
        config: BatchConfig,
    ) -> Result<Arc<Self>, MessagingError> {
        Self::build(channel, config, None)
    }

    /// Create a publisher that records flush outcomes into `metrics`.
    pub fn with_metrics(
        channel: Arc<dyn BrokerChannel>,
        config: BatchConfig,
        metrics: Arc<MetricsRegistry>,
    ) -> Result<Arc<Self>, MessagingError> {
        Self::build(channel, config, Some(metrics))
    }

    fn build(
        channel: Arc<dyn BrokerChannel>,
        config: BatchConfig,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Arc<Self>, MessagingError> {
        config.validate()?;
        info!(
            exchange = %config.exchange,
            batch_size = config.batch_size,
            flush_interval = ?config.flush_interval,
            retry = ?config.retry,
            "Batch publisher initialized"
        );

        let publisher = Arc::new(Self {
            config,
            channel,
            metrics,
            buffer: Mutex::new(VecDeque::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            closed: AtomicBool::new(false),
            shutdown: Arc::new(Notify::new()),
            timer: Mutex::new(None),
            dropped_hook: Mutex::new(None),
            flushes: AtomicU64::new(0),
            failed_flushes: AtomicU64::new(0),
            items_published: AtomicU64::new(0),
            items_dropped: AtomicU64::new(0),
        });
        publisher.spawn_timer();
        Ok(publisher)
    }

    fn spawn_timer(self: &Arc<Self>) {
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            debug!(exchange = %self.config.exchange, "No runtime, timed flushes disabled");
            return;
        };

        let weak: Weak<Self> = Arc::downgrade(self);
        let shutdown = Arc::clone(&self.shutdown);
        let interval = self.config.flush_interval;
        let task = handle.spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown.notified() => break,
                }
                let Some(publisher) = weak.upgrade() else { break };
                if publisher.pending() == 0 {
                    continue;
                }
                if let Err(e) = publisher.flush().await {
                    debug!(error = %e, "Timed flush failed");
                }
            }
        });
        *self.timer.lock() = Some(task);
    }

    pub fn config(&self) -> &BatchConfig {
        &self.config
    }

    /// Run `hook` with the items of every batch dropped after exhausting
    /// its retries. Replaces any earlier hook.
    pub fn on_dropped<F>(&self, hook: F)
    where
        F: Fn(Vec<BatchItem>) -> BoxFuture<'static, ()> + Send + Sync + 'static,
    {
        *self.dropped_hook.lock() = Some(Arc::new(hook));
    }

    /// Items waiting for the next flush.
    pub fn pending(&self) -> usize {
        self.buffer.lock().len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> BatchStats {
        BatchStats {
            flushes: self.flushes.load(Ordering::Relaxed),
            failed_flushes: self.failed_flushes.load(Ordering::Relaxed),
            items_published: self.items_published.load(Ordering::Relaxed),
            items_dropped: self.items_dropped.load(Ordering::Relaxed),
        }
    }

    /// Buffer an item, flushing once `batch_size` items are pending.
    ///
    /// Returns once the item is buffered. A failure of the flush it triggers
    /// is handled like a failed timed flush (logged, retried, or dropped per
    /// policy); call [`flush`](Self::flush) to observe it directly.
    pub async fn add(&self, item: BatchItem) -> Result<(), BatchError> {
        let should_flush = {
            let mut buffer = self.buffer.lock();
            if self.closed.load(Ordering::SeqCst) {
                return Err(BatchError::Closed);
            }
            if buffer.len() >= self.config.max_buffer {
                warn!(
                    exchange = %self.config.exchange,
                    pending = buffer.len(),
                    "Batch buffer full, rejecting item"
                );
                return Err(BatchError::BufferFull {
                    pending: buffer.len(),
                    limit: self.config.max_buffer,
                });
            }
            buffer.push_back(item);
            buffer.len() >= self.config.batch_size
        };

        if should_flush && let Err(e) = self.flush().await {
            debug!(error = %e, "Size-triggered flush failed");
        }
        Ok(())
    }

    /// Publish everything pending as one batch and wait for its confirmation.
    ///
    /// Returns the number of items published.
    pub async fn flush(&self) -> Result<usize, BatchError> {
        let _flushing = self.flush_lock.lock().await;

        let drained: Vec<BatchItem> = self.buffer.lock().drain(..).collect();
        if drained.is_empty() {
            return Ok(0);
        }

        let batch_id = Uuid::new_v4().to_string();
        let size = drained.len();
        let messages: Vec<OutboundMessage> = drained
            .iter()
            .map(|item| item.to_message(&self.config.exchange, &batch_id, size))
            .collect();
        let mut in_flight = InFlight {
            publisher: self,
            batch_id: batch_id.clone(),
            items: Some(drained),
        };

        match self.publish_with_retry(&batch_id, &messages).await {
            Ok(()) => {
                in_flight.items = None;
                self.flushes.fetch_add(1, Ordering::Relaxed);
                self.items_published
                    .fetch_add(size as u64, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_batch_flush(&self.config.exchange, true);
                }
                debug!(batch_id = %batch_id, items = size, "Batch flushed");
                Ok(size)
            }
            Err((attempts, source)) => {
                let batch = in_flight.items.take().unwrap_or_default();
                self.failed_flushes.fetch_add(1, Ordering::Relaxed);
                if let Some(metrics) = &self.metrics {
                    metrics.record_batch_flush(&self.config.exchange, false);
                }

                if self.config.retry.is_some() {
                    self.items_dropped.fetch_add(size as u64, Ordering::Relaxed);
                    if let Some(metrics) = &self.metrics {
                        metrics.record_batch_dropped(&self.config.exchange, size);
                    }
                    error!(
                        batch_id = %batch_id,
                        items = size,
                        attempts,
                        error = %source,
                        "Batch dropped after exhausting retries"
                    );
                    let hook = self.dropped_hook.lock().clone();
                    if let Some(hook) = hook {
                        hook(batch).await;
                    }
                    return Err(BatchError::Dropped {
                        batch_id,
                        items: size,
                        attempts,
                        source,
                    });
                }

                warn!(
                    batch_id = %batch_id,
                    items = size,
                    error = %source,
                    "Batch flush failed, keeping items for the next flush"
                );
                self.requeue(batch);
                Err(BatchError::Requeued {
                    items: size,
                    source,
                })
            }
        }
    }

    /// Put `items` back at the head of the buffer, ahead of newer adds.
    fn requeue(&self, items: Vec<BatchItem>) {
        let mut buffer = self.buffer.lock();
        for item in items.into_iter().rev() {
            buffer.push_front(item);
        }
    }

    /// Flush the remainder and stop the timer. Later `add` calls fail with
    /// [`BatchError::Closed`].
    pub async fn close(&self) -> Result<usize, BatchError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(0);
        }
        self.shutdown.notify_one();
        self.timer.lock().take();

        let flushed = self.flush().await;
        info!(exchange = %self.config.exchange, "Batch publisher closed");
        flushed
    }

    async fn publish_with_retry(
        &self,
        batch_id: &str,
        messages: &[OutboundMessage],
    ) -> Result<(), (u32, MessagingError)> {
        let (max_retries, backoff) = match &self.config.retry {
            Some(policy) => (
                policy.max_retries,
                Backoff::Linear {
                    step: policy.retry_delay,
                    max: Duration::MAX,
                },
            ),
            None => (0, Backoff::None),
        };

        let mut attempt = 0;
        loop {
            match self.send(messages).await {
                Ok(()) => return Ok(()),
                Err(error) if attempt < max_retries => {
                    attempt += 1;
                    let delay = backoff.delay(attempt);
                    warn!(
                        batch_id,
                        attempt,
                        max_retries,
                        delay = ?delay,
                        error = %error,
                        "Batch flush failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(error) => return Err((attempt + 1, error)),
            }
        }
    }

    async fn send(&self, messages: &[OutboundMessage]) -> Result<(), MessagingError> {
        for message in messages {
            self.channel.publish(message).await?;
        }
        match tokio::time::timeout(self.config.confirm_timeout, self.channel.wait_for_confirms())
            .await
        {
            Ok(confirmed) => confirmed,
            Err(_) => Err(MessagingError::Timeout(self.config.confirm_timeout)),
        }
    }
}

/// A drained batch awaiting confirmation. Dropped while it still holds the
/// items, the flush was cancelled and the batch goes back to the buffer.
struct InFlight<'a> {
    publisher: &'a BatchPublisher,
    batch_id: String,
    items: Option<Vec<BatchItem>>,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        let Some(items) = self.items.take() else {
            return;
        };
        warn!(
            batch_id = %self.batch_id,
            items = items.len(),
            "Batch flush cancelled, returning items to the buffer"
        );
        self.publisher.requeue(items);
    }
}

impl Drop for BatchPublisher {
    fn drop(&mut self) {
        if let Some(task) = self.timer.get_mut().take() {
            task.abort();
        }
        let pending = self.buffer.get_mut().len();
        if pending > 0 {
            warn!(
                exchange = %self.config.exchange,
                pending,
                "Batch publisher dropped with unflushed items"
            );
        }
    }
}

impl fmt::Debug for BatchPublisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BatchPublisher")
            .field("exchange", &self.config.exchange)
            .field("pending", &self.pending())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ExchangeConfig, QueueConfig};
    use crate::memory::MemoryBroker;
    use futures::FutureExt;

    async fn broker_with_sink() -> (MemoryBroker, Arc<dyn BrokerChannel>) {
        let broker = MemoryBroker::new();
        let channel = broker.channel();
        channel
            .declare_exchange(&ExchangeConfig::topic("events"))
            .await
            .unwrap();
        channel.declare_queue(&QueueConfig::new("sink")).await.unwrap();
        channel.bind_queue("sink", "events", "#").await.unwrap();
        (broker, Arc::new(channel))
    }

    fn drain(broker: &MemoryBroker) -> Vec<(String, String, String)> {
        std::iter::from_fn(|| broker.get("sink"))
            .map(|d| {
                (
                    d.body_str().unwrap().to_string(),
                    d.header(BATCH_ID_HEADER).unwrap().to_string(),
                    d.header(BATCH_SIZE_HEADER).unwrap().to_string(),
                )
            })
            .collect()
    }

    fn item(body: &str) -> BatchItem {
        BatchItem::new("PING", body.as_bytes().to_vec())
    }

    #[tokio::test(start_paused = true)]
    async fn test_full_batch_flushes_once_in_order() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(3)
            .flush_interval(Duration::from_secs(60));
        let publisher = BatchPublisher::new(channel, config).unwrap();

        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();
        assert_eq!(publisher.stats().flushes, 0);
        publisher.add(item("c")).await.unwrap();

        assert_eq!(publisher.stats().flushes, 1);
        assert_eq!(publisher.pending(), 0);

        let published = drain(&broker);
        let bodies: Vec<&str> = published.iter().map(|(b, _, _)| b.as_str()).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
        assert!(published.iter().all(|(_, id, _)| *id == published[0].1));
        assert!(published.iter().all(|(_, _, size)| size == "3"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_flushes_sparse_traffic() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(3)
            .flush_interval(Duration::from_millis(500));
        let publisher = BatchPublisher::new(channel, config).unwrap();

        publisher.add(item("only")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(publisher.stats().flushes, 0);

        tokio::time::sleep(Duration::from_millis(260)).await;
        assert_eq!(publisher.stats().flushes, 1);

        let published = drain(&broker);
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].0, "only");
        assert_eq!(published[0].2, "1");

        // Nothing pending, so later ticks do not flush.
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(publisher.stats().flushes, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_confirm_retries_whole_batch_with_linear_backoff() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(2)
            .flush_interval(Duration::from_secs(60))
            .retry(3, Duration::from_millis(100));
        let publisher = BatchPublisher::new(channel, config).unwrap();
        broker.fail_confirms(2);

        let started = Instant::now();
        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();

        // 100ms before the first retry, 200ms before the second.
        assert_eq!(started.elapsed(), Duration::from_millis(300));
        assert_eq!(publisher.stats().flushes, 1);
        assert_eq!(publisher.stats().items_published, 2);

        // Every attempt re-sends the full batch in order under the same batch id.
        let published = drain(&broker);
        let bodies: Vec<&str> = published.iter().map(|(b, _, _)| b.as_str()).collect();
        assert_eq!(bodies, ["a", "b", "a", "b", "a", "b"]);
        assert!(published.iter().all(|(_, id, _)| *id == published[0].1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_drop_the_batch() {
        let (broker, channel) = broker_with_sink().await;
        let metrics = Arc::new(MetricsRegistry::new("batch_test").unwrap());
        let config = BatchConfig::new("events")
            .batch_size(10)
            .flush_interval(Duration::from_secs(60))
            .retry(2, Duration::from_millis(10));
        let publisher = BatchPublisher::with_metrics(channel, config, Arc::clone(&metrics)).unwrap();
        broker.fail_confirms(10);

        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();
        let err = publisher.flush().await.unwrap_err();

        match err {
            BatchError::Dropped {
                items, attempts, ..
            } => {
                assert_eq!(items, 2);
                assert_eq!(attempts, 3);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(publisher.pending(), 0);
        assert_eq!(publisher.stats().items_dropped, 2);

        let export = metrics.export();
        assert!(export.contains("batch_test_batch_dropped_items_total"));
        assert!(export.contains("outcome=\"error\""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_batch_is_handed_to_hook() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(10)
            .flush_interval(Duration::from_secs(60))
            .retry(1, Duration::from_millis(10));
        let publisher = BatchPublisher::new(channel, config).unwrap();
        broker.fail_confirms(10);

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        publisher.on_dropped(move |items| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(items);
            }
            .boxed()
        });

        publisher.add(item("a").with_correlation_id("c1")).await.unwrap();
        assert!(publisher.flush().await.is_err());

        let dropped = rx.try_recv().unwrap();
        assert_eq!(dropped.len(), 1);
        assert_eq!(dropped[0].correlation_id.as_deref(), Some("c1"));
        assert_eq!(dropped[0].body, b"a");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_flush_returns_batch_to_buffer() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(10)
            .flush_interval(Duration::from_secs(60))
            .retry(5, Duration::from_secs(1));
        let publisher = BatchPublisher::new(channel, config).unwrap();
        broker.fail_confirms(100);

        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();

        // Cancelled during the backoff before the second retry.
        let cancelled = tokio::time::timeout(Duration::from_millis(1500), publisher.flush()).await;
        assert!(cancelled.is_err());
        assert_eq!(publisher.pending(), 2);
        assert_eq!(publisher.stats(), BatchStats::default());

        publisher.add(item("c")).await.unwrap();
        broker.fail_confirms(0);
        drain(&broker);
        assert_eq!(publisher.close().await.unwrap(), 3);

        let bodies: Vec<String> = drain(&broker).into_iter().map(|(b, _, _)| b).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_retry_keeps_items_until_buffer_is_full() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(2)
            .max_buffer(3)
            .flush_interval(Duration::from_secs(60))
            .without_retry();
        let publisher = BatchPublisher::new(channel, config).unwrap();
        broker.fail_confirms(5);

        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();
        assert_eq!(publisher.pending(), 2);
        publisher.add(item("c")).await.unwrap();
        assert_eq!(publisher.pending(), 3);

        let err = publisher.add(item("d")).await.unwrap_err();
        assert!(matches!(
            err,
            BatchError::BufferFull {
                pending: 3,
                limit: 3
            }
        ));

        broker.fail_confirms(0);
        drain(&broker);
        assert_eq!(publisher.flush().await.unwrap(), 3);

        let bodies: Vec<String> = drain(&broker).into_iter().map(|(b, _, _)| b).collect();
        assert_eq!(bodies, ["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_confirm_timeout_counts_as_failure() {
        struct SilentBroker;

        #[async_trait::async_trait]
        impl BrokerChannel for SilentBroker {
            async fn declare_exchange(&self, _: &ExchangeConfig) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn declare_queue(&self, _: &QueueConfig) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn bind_queue(&self, _: &str, _: &str, _: &str) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn unbind_queue(&self, _: &str, _: &str, _: &str) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn publish(&self, _: &OutboundMessage) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn wait_for_confirms(&self) -> Result<(), MessagingError> {
                futures::future::pending().await
            }
            async fn consume(
                &self,
                _: crate::message::ConsumeOptions,
            ) -> Result<crate::traits::MessageStream, MessagingError> {
                Err(MessagingError::Subscribe("unsupported".into()))
            }
            async fn cancel(&self, _: &str) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn ack(&self, _: u64) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn nack(&self, _: u64, _: bool) -> Result<(), MessagingError> {
                Ok(())
            }
            async fn queue_status(
                &self,
                queue: &str,
            ) -> Result<crate::message::QueueStatus, MessagingError> {
                Err(MessagingError::NotFound(queue.to_string()))
            }
            async fn exchange_exists(&self, _: &str) -> Result<bool, MessagingError> {
                Ok(true)
            }
            fn is_connected(&self) -> bool {
                true
            }
            async fn close(&self) -> Result<(), MessagingError> {
                Ok(())
            }
        }

        let config = BatchConfig::new("events")
            .batch_size(10)
            .flush_interval(Duration::from_secs(60))
            .confirm_timeout(Duration::from_secs(2))
            .retry(1, Duration::from_secs(1));
        let publisher = BatchPublisher::new(Arc::new(SilentBroker), config).unwrap();
        publisher.add(item("a")).await.unwrap();

        let started = Instant::now();
        let err = publisher.flush().await.unwrap_err();
        assert!(err.broker_error().unwrap().is_timeout());
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_flushes_remainder_and_refuses_adds() {
        let (broker, channel) = broker_with_sink().await;
        let config = BatchConfig::new("events")
            .batch_size(10)
            .flush_interval(Duration::from_secs(60));
        let publisher = BatchPublisher::new(channel, config).unwrap();

        publisher.add(item("a")).await.unwrap();
        publisher.add(item("b")).await.unwrap();
        assert_eq!(publisher.close().await.unwrap(), 2);
        assert!(publisher.is_closed());
        assert_eq!(broker.depth("sink"), 2);

        assert!(matches!(
            publisher.add(item("c")).await,
            Err(BatchError::Closed)
        ));
        assert_eq!(publisher.close().await.unwrap(), 0);
    }

    #[test]
    fn test_config_validation() {
        assert!(BatchConfig::new("events").validate().is_ok());
        assert!(BatchConfig::new("events").batch_size(0).validate().is_err());
        assert!(
            BatchConfig::new("events")
                .batch_size(10)
                .max_buffer(5)
                .validate()
                .is_err()
        );
    }

    #[test]
    fn test_item_carries_batch_headers() {
        let item = BatchItem::json("PING", &serde_json::json!({"n": 1}))
            .unwrap()
            .with_correlation_id("c1");
        let message = item.to_message("events", "batch-1", 4);

        assert_eq!(message.exchange, "events");
        assert_eq!(message.message_id, item.message_id);
        assert_eq!(message.header(BATCH_ID_HEADER), Some("batch-1"));
        assert_eq!(message.header(BATCH_SIZE_HEADER), Some("4"));
        assert_eq!(message.correlation_id.as_deref(), Some("c1"));
    }
}
