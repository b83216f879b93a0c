//! Event bus over a message broker
//!
//! Publishing validates the event, optionally skips correlation ids already
//! published within the de-duplication window, and either sends the event
//! straight to the topic exchange (routing key = event type) or hands it to
//! the batch publisher.
//!
//! Every subscription owns one queue and one dispatch task. A delivery is
//! validated, optionally checked against the processed window, and passed to
//! the handler through the event type's circuit breaker. Success acks the
//! delivery; a handler failure nacks it so the broker's retry and
//! dead-letter policy applies. Invalid events skip the retries and go
//! straight to the dead-letter exchange.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use meridian_health::{BrokerHealthIndicator, CacheHealthIndicator, HealthChecker};
use meridian_messaging::{
    BatchConfig, BatchItem, BatchPublisher, BrokerChannel, ConsumeOptions, DEATH_QUEUE_HEADER,
    Delivery, ExchangeConfig, MessageStream, OutboundMessage, QueueConfig,
};
use meridian_metrics::{CacheOutcome, MetricsRegistry};
use meridian_redis::CacheStore;
use meridian_resilience::{CircuitBreaker, CircuitBreakerConfig};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::BusConfig;
use crate::error::{BusError, ValidationError};
use crate::event::{ENVELOPE_VERSION, Event, EventPayload};
use crate::handler::EventHandler;
use crate::registry::SchemaRegistry;
use crate::validator::EventValidator;

/// Header naming why an event was dead-lettered without reaching its handler.
pub const REJECTION_REASON_HEADER: &str = "x-rejection-reason";

const CONTENT_TYPE_JSON: &str = "application/json";

/// How long `unsubscribe` waits for an in-flight delivery before aborting the loop.
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Options for a single publish
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PublishOptions {
    /// Skip the event if its correlation id was published within the TTL window
    pub cache: bool,
    /// Buffer the event in the batch publisher instead of sending it now
    pub batch: bool,
    /// Survive a broker restart
    pub persistent: bool,
}

impl Default for PublishOptions {
    fn default() -> Self {
        Self {
            cache: false,
            batch: false,
            persistent: true,
        }
    }
}

impl PublishOptions {
    pub fn cached(mut self) -> Self {
        self.cache = true;
        self
    }

    pub fn batched(mut self) -> Self {
        self.batch = true;
        self
    }

    pub fn transient(mut self) -> Self {
        self.persistent = false;
        self
    }
}

/// What `publish` did with the event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent and confirmed by the broker
    Sent,
    /// Buffered; the batch publisher confirms it with its batch
    Batched,
    /// Already published within the de-duplication window
    Duplicate,
}

/// Options for a subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Keep the queue (and its messages) across consumer restarts
    pub durable: bool,
    /// Skip events whose correlation id was already processed within the TTL window
    pub use_cache: bool,
    /// Queue name; `{service}.{type}` when unset
    pub queue: Option<String>,
    /// Unacknowledged deliveries; the bus default when unset
    pub prefetch: Option<u16>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            durable: true,
            use_cache: false,
            queue: None,
            prefetch: None,
        }
    }
}

impl SubscribeOptions {
    /// A queue deleted with its consumer
    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn with_cache(mut self) -> Self {
        self.use_cache = true;
        self
    }

    pub fn queue(mut self, name: impl Into<String>) -> Self {
        self.queue = Some(name.into());
        self
    }

    pub fn prefetch(mut self, count: u16) -> Self {
        self.prefetch = Some(count);
        self
    }
}

/// An active subscription
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Subscription {
    pub event_type: String,
    pub queue: String,
    pub dead_letter_queue: String,
    pub consumer_tag: String,
    pub durable: bool,
    pub use_cache: bool,
}

struct ActiveSubscription {
    info: Subscription,
    task: JoinHandle<()>,
}

/// Builder for [`EventBus`]
pub struct EventBusBuilder {
    channel: Arc<dyn BrokerChannel>,
    cache: Option<Arc<dyn CacheStore>>,
    metrics: Option<Arc<MetricsRegistry>>,
    schemas: Option<SchemaRegistry>,
    config: BusConfig,
    require_uuid_correlation: bool,
}

impl EventBusBuilder {
    /// Cache store backing the de-duplication windows
    pub fn cache(mut self, cache: Arc<dyn CacheStore>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Schemas to validate against; the built-in catalog when unset
    pub fn schemas(mut self, schemas: SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn config(mut self, config: BusConfig) -> Self {
        self.config = config;
        self
    }

    /// Whether correlation ids must be UUIDs (default `true`)
    pub fn require_uuid_correlation(mut self, required: bool) -> Self {
        self.require_uuid_correlation = required;
        self
    }

    /// Declare the exchanges and start the batch publisher.
    pub async fn build(self) -> Result<EventBus, BusError> {
        let config = self.config;
        config.validate()?;

        let metrics = match self.metrics {
            Some(metrics) => metrics,
            None => Arc::new(
                MetricsRegistry::new("meridian")
                    .map_err(|e| BusError::Configuration(e.to_string()))?,
            ),
        };
        let validator = EventValidator::new(self.schemas.unwrap_or_else(SchemaRegistry::with_catalog))
            .require_uuid_correlation(self.require_uuid_correlation);

        let breaker = |name: &str, timeout: Duration| {
            CircuitBreaker::with_metrics(
                CircuitBreakerConfig::new(name)
                    .error_threshold(config.error_threshold)
                    .reset_timeout(config.reset_timeout)
                    .timeout(timeout),
                Arc::clone(&metrics),
            )
        };
        let broker_breaker = breaker("broker", config.operation_timeout);
        let cache_breaker = breaker("cache", config.operation_timeout);

        let channel = self.channel;
        broker_breaker
            .call(|| async {
                channel
                    .declare_exchange(&ExchangeConfig::topic(&config.exchange))
                    .await?;
                channel
                    .declare_exchange(&ExchangeConfig::topic(&config.dead_letter_exchange))
                    .await
            })
            .await
            .map_err(|e| BusError::from_breaker("broker", e))?;

        let batch = BatchConfig::new(&config.exchange)
            .batch_size(config.batch_size)
            .flush_interval(config.flush_interval)
            .max_buffer(config.max_buffer)
            .confirm_timeout(config.operation_timeout)
            .retry(config.max_retries, config.retry_delay);
        let publisher =
            BatchPublisher::with_metrics(Arc::clone(&channel), batch, Arc::clone(&metrics))?;

        info!(
            service = %config.service_name,
            exchange = %config.exchange,
            dead_letter_exchange = %config.dead_letter_exchange,
            cache = self.cache.is_some(),
            event_types = ?validator.registry().event_types(),
            "Event bus started"
        );

        let inner = Arc::new(Inner {
            config,
            channel,
            cache: self.cache,
            metrics,
            validator,
            publisher,
            broker_breaker,
            cache_breaker,
            handler_breakers: DashMap::new(),
            subscriptions: DashMap::new(),
            closed: AtomicBool::new(false),
        });

        let weak = Arc::downgrade(&inner);
        inner.publisher.on_dropped(move |items| {
            let weak = weak.clone();
            async move {
                if let Some(inner) = weak.upgrade() {
                    inner.forget_dropped(&items).await;
                }
            }
            .boxed()
        });

        Ok(EventBus { inner })
    }
}

/// Typed publish/subscribe over a broker channel.
///
/// Cloning is cheap; clones share the channel, the subscriptions and the
/// breakers. The bus owns the channel and the cache store, and closes both
/// in [`close`](EventBus::close).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Inner>,
}

struct Inner {
    config: BusConfig,
    channel: Arc<dyn BrokerChannel>,
    cache: Option<Arc<dyn CacheStore>>,
    metrics: Arc<MetricsRegistry>,
    validator: EventValidator,
    publisher: Arc<BatchPublisher>,
    broker_breaker: Arc<CircuitBreaker>,
    cache_breaker: Arc<CircuitBreaker>,
    handler_breakers: DashMap<String, Arc<CircuitBreaker>>,
    subscriptions: DashMap<String, ActiveSubscription>,
    closed: AtomicBool,
}

impl EventBus {
    pub fn builder(channel: Arc<dyn BrokerChannel>) -> EventBusBuilder {
        EventBusBuilder {
            channel,
            cache: None,
            metrics: None,
            schemas: None,
            config: BusConfig::default(),
            require_uuid_correlation: true,
        }
    }

    /// Publish a cataloged payload as a new causal chain from this service.
    pub async fn publish<T: EventPayload>(
        &self,
        data: T,
        options: PublishOptions,
    ) -> Result<PublishOutcome, BusError> {
        let event = Event::typed(data, self.inner.config.service_name.clone());
        self.publish_event(&event, options).await
    }

    /// Publish a fully formed event, keeping its metadata.
    pub async fn publish_event<T: Serialize>(
        &self,
        event: &Event<T>,
        options: PublishOptions,
    ) -> Result<PublishOutcome, BusError> {
        let value = serde_json::to_value(event).map_err(|e| BusError::Serialization(e.to_string()))?;
        self.publish_json(value, options).await
    }

    /// Publish a raw envelope. Missing metadata fields are stamped before
    /// validation; fields already present are never changed.
    pub async fn publish_json(
        &self,
        mut event: Value,
        options: PublishOptions,
    ) -> Result<PublishOutcome, BusError> {
        self.ensure_open()?;
        let inner = &self.inner;

        inner.stamp_metadata(&mut event);
        inner.validator.check(&event)?;

        let event_type = event["type"].as_str().unwrap_or_default().to_string();
        let correlation_id = event["metadata"]["correlationId"]
            .as_str()
            .unwrap_or_default()
            .to_string();
        let body = serde_json::to_vec(&event).map_err(|e| BusError::Serialization(e.to_string()))?;

        let dedup_key = options
            .cache
            .then(|| inner.dedup_key("published", &event_type, &correlation_id));
        if let Some(key) = &dedup_key
            && inner.seen(key).await
        {
            info!(event_type, correlation_id, "Skipping duplicate publish");
            inner.metrics.record_duplicate(&event_type);
            return Ok(PublishOutcome::Duplicate);
        }

        let outcome = if options.batch {
            let mut item = BatchItem::new(&event_type, body).with_correlation_id(&correlation_id);
            item.content_type = Some(CONTENT_TYPE_JSON.to_string());
            if !options.persistent {
                item = item.transient();
            }
            // Marked before buffering; a dropped batch clears its marks.
            if let Some(key) = &dedup_key {
                inner.remember(key).await;
            }
            if let Err(e) = inner.publisher.add(item).await {
                if let Some(key) = &dedup_key {
                    inner.forget(key).await;
                }
                return Err(e.into());
            }
            PublishOutcome::Batched
        } else {
            let mut message = OutboundMessage::new(&inner.config.exchange, &event_type, body)
                .with_correlation_id(&correlation_id)
                .with_content_type(CONTENT_TYPE_JSON);
            if !options.persistent {
                message = message.transient();
            }
            inner.send(&message).await?;
            if let Some(key) = &dedup_key {
                inner.remember(key).await;
            }
            PublishOutcome::Sent
        };

        inner.metrics.record_published(&event_type, options.batch);
        debug!(event_type, correlation_id, outcome = ?outcome, "Event published");
        Ok(outcome)
    }

    /// Flush batched events now.
    pub async fn flush(&self) -> Result<usize, BusError> {
        Ok(self.inner.publisher.flush().await?)
    }

    /// Batched events waiting for a flush.
    pub fn pending(&self) -> usize {
        self.inner.publisher.pending()
    }

    /// Subscribe `handler` to the payload's event type.
    ///
    /// A type has at most one handler per bus; subscribing again replaces
    /// the previous handler.
    pub async fn subscribe<T, H>(
        &self,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError>
    where
        T: EventPayload,
        H: EventHandler<T>,
    {
        self.subscribe_type(T::EVENT_TYPE, handler, options).await
    }

    /// Subscribe `handler` to a type by tag, decoding payloads as `T`.
    ///
    /// The type must have a registered schema.
    pub async fn subscribe_type<T, H>(
        &self,
        event_type: &str,
        handler: H,
        options: SubscribeOptions,
    ) -> Result<Subscription, BusError>
    where
        T: DeserializeOwned + Send + 'static,
        H: EventHandler<T>,
    {
        self.ensure_open()?;
        let inner = &self.inner;
        if !inner.validator.registry().contains(event_type) {
            return Err(ValidationError::UnknownEventType(event_type.to_string()).into());
        }
        if inner.stop(event_type, false).await? {
            info!(event_type, "Replacing existing subscription");
        }

        let config = &inner.config;
        let queue_name = match &options.queue {
            Some(name) => name.clone(),
            None if options.durable => format!("{}.{}", config.service_name, event_type),
            None => format!(
                "{}.{}.{}",
                config.service_name,
                event_type,
                Uuid::new_v4().simple()
            ),
        };

        let mut queue = QueueConfig::new(&queue_name)
            .with_dead_letter_exchange(&config.dead_letter_exchange)
            .with_dead_letter_routing_key(&queue_name)
            .with_retries(config.max_retries, config.retry_delay);
        let mut dead_letter = QueueConfig::new(queue.dead_letter_queue_name());
        if !options.durable {
            queue = queue.transient();
            dead_letter.durable = false;
        }
        let dead_letter_name = dead_letter.name.clone();

        let consume = ConsumeOptions::new(&queue_name)
            .prefetch(options.prefetch.unwrap_or(config.prefetch));
        let consumer_tag = consume.consumer_tag.clone();

        let channel = &inner.channel;
        let deliveries = inner
            .broker_breaker
            .call(|| async {
                channel.declare_queue(&dead_letter).await?;
                channel
                    .bind_queue(&dead_letter_name, &config.dead_letter_exchange, &queue_name)
                    .await?;
                channel.declare_queue(&queue).await?;
                channel
                    .bind_queue(&queue_name, &config.exchange, event_type)
                    .await?;
                channel.consume(consume).await
            })
            .await
            .map_err(|e| BusError::from_breaker("broker", e))?;

        let breaker = inner
            .handler_breakers
            .entry(event_type.to_string())
            .or_insert_with(|| {
                CircuitBreaker::with_metrics(
                    CircuitBreakerConfig::new(format!("handler:{}", event_type))
                        .error_threshold(config.error_threshold)
                        .reset_timeout(config.reset_timeout)
                        .timeout(config.handler_timeout),
                    Arc::clone(&inner.metrics),
                )
            })
            .value()
            .clone();

        let subscription = Subscription {
            event_type: event_type.to_string(),
            queue: queue_name,
            dead_letter_queue: dead_letter_name,
            consumer_tag,
            durable: options.durable,
            use_cache: options.use_cache,
        };

        let worker = Worker {
            bus: Arc::downgrade(&self.inner),
            subscription: subscription.clone(),
            breaker,
            handler,
            _event: PhantomData,
        };
        let task = tokio::spawn(worker.run(deliveries));
        inner.subscriptions.insert(
            event_type.to_string(),
            ActiveSubscription {
                info: subscription.clone(),
                task,
            },
        );

        info!(
            event_type,
            queue = %subscription.queue,
            durable = subscription.durable,
            use_cache = subscription.use_cache,
            "Subscribed"
        );
        Ok(subscription)
    }

    /// Stop consuming `event_type` and unbind its queue from the exchange.
    ///
    /// Returns `false` when the type had no subscription.
    pub async fn unsubscribe(&self, event_type: &str) -> Result<bool, BusError> {
        self.inner.stop(event_type, true).await
    }

    /// Drain the batch publisher, unbind and stop every subscription, then
    /// close the broker channel and cache store.
    ///
    /// Durable queues are kept with whatever they still hold. Every step runs
    /// even if an earlier one fails; the first error is returned.
    pub async fn close(&self) -> Result<(), BusError> {
        let inner = &self.inner;
        if inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!(service = %inner.config.service_name, "Closing event bus");

        let mut first_error: Option<BusError> = None;
        let mut note = |step: &str, error: BusError| {
            error!(step, error = %error, "Event bus shutdown step failed");
            first_error.get_or_insert(error);
        };

        match inner.publisher.close().await {
            Ok(flushed) => debug!(flushed, "Batch publisher drained"),
            Err(e) => note("drain batch publisher", e.into()),
        }

        let event_types: Vec<String> = inner
            .subscriptions
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for event_type in event_types {
            if let Err(e) = inner.stop(&event_type, true).await {
                note("stop subscription", e);
            }
        }

        if let Err(e) = inner.channel.close().await {
            note("close broker channel", e.into());
        }
        if let Some(cache) = &inner.cache
            && let Err(e) = cache.close().await
        {
            note("close cache store", e.into());
        }

        info!(service = %inner.config.service_name, "Event bus closed");
        first_error.map_or(Ok(()), Err)
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &BusConfig {
        &self.inner.config
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.inner.metrics
    }

    pub fn validator(&self) -> &EventValidator {
        &self.inner.validator
    }

    /// Active subscriptions, ordered by event type.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        let mut subscriptions: Vec<Subscription> = self
            .inner
            .subscriptions
            .iter()
            .map(|entry| entry.info.clone())
            .collect();
        subscriptions.sort_by(|a, b| a.event_type.cmp(&b.event_type));
        subscriptions
    }

    /// The breaker guarding `event_type`'s handler, once subscribed.
    pub fn handler_breaker(&self, event_type: &str) -> Option<Arc<CircuitBreaker>> {
        self.inner
            .handler_breakers
            .get(event_type)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn broker_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.broker_breaker
    }

    pub fn cache_breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.cache_breaker
    }

    /// A health checker probing this bus's broker channel, exchange,
    /// subscription queues and cache store.
    pub fn health_checker(&self) -> HealthChecker {
        let inner = &self.inner;
        let mut broker = BrokerHealthIndicator::new(Arc::clone(&inner.channel), &inner.config.exchange);
        for subscription in self.subscriptions() {
            broker = broker
                .with_queue(subscription.queue)
                .with_dead_letter_queue(subscription.dead_letter_queue);
        }

        let mut checker = HealthChecker::new()
            .with_probe_timeout(inner.config.operation_timeout)
            .with_indicator(broker);
        if let Some(cache) = &inner.cache {
            checker = checker.with_indicator(CacheHealthIndicator::new(Arc::clone(cache)));
        }
        checker
    }

    fn ensure_open(&self) -> Result<(), BusError> {
        if self.is_closed() {
            return Err(BusError::Closed);
        }
        Ok(())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("service", &self.inner.config.service_name)
            .field("exchange", &self.inner.config.exchange)
            .field("subscriptions", &self.inner.subscriptions.len())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Inner {
    /// Fill in absent or null metadata fields.
    fn stamp_metadata(&self, event: &mut Value) {
        let Some(envelope) = event.as_object_mut() else {
            return;
        };
        let schema_version = envelope
            .get("type")
            .and_then(Value::as_str)
            .and_then(|event_type| self.validator.registry().version(event_type))
            .unwrap_or("1")
            .to_string();

        let metadata = envelope
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if metadata.is_null() {
            *metadata = Value::Object(Map::new());
        }
        let Some(metadata) = metadata.as_object_mut() else {
            return;
        };

        let defaults = [
            ("version", ENVELOPE_VERSION.to_string()),
            ("source", self.config.service_name.clone()),
            ("correlationId", Uuid::new_v4().to_string()),
            ("timestamp", Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
            ("schemaVersion", schema_version),
        ];
        for (key, default) in defaults {
            let slot = metadata.entry(key).or_insert(Value::Null);
            if slot.is_null() {
                *slot = Value::String(default);
            }
        }
    }

    async fn send(&self, message: &OutboundMessage) -> Result<(), BusError> {
        let channel = &self.channel;
        self.broker_breaker
            .call(|| async move {
                channel.publish(message).await?;
                channel.wait_for_confirms().await
            })
            .await
            .map_err(|e| BusError::from_breaker(self.broker_breaker.name(), e))
    }

    fn dedup_key(&self, stage: &str, event_type: &str, correlation_id: &str) -> String {
        format!(
            "{}:{}:{}:{}",
            self.config.cache_prefix, stage, event_type, correlation_id
        )
    }

    /// Whether `key` is marked. Cache failures count as "not seen": the
    /// window is an idempotency aid and delivery stays at-least-once.
    async fn seen(&self, key: &str) -> bool {
        let Some(cache) = &self.cache else {
            return false;
        };
        match self.cache_breaker.call(|| cache.get(key)).await {
            Ok(found) => {
                let outcome = if found.is_some() {
                    CacheOutcome::Hit
                } else {
                    CacheOutcome::Miss
                };
                self.metrics.record_cache(&self.config.service_name, outcome);
                found.is_some()
            }
            Err(e) => {
                warn!(key, error = %BusError::from_breaker("cache", e), "De-duplication lookup failed");
                false
            }
        }
    }

    async fn remember(&self, key: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        let ttl = self.config.dedup_ttl;
        if let Err(e) = self
            .cache_breaker
            .call(|| cache.set(key, "1", Some(ttl)))
            .await
        {
            warn!(key, error = %BusError::from_breaker("cache", e), "Failed to mark de-duplication key");
        }
    }

    async fn forget(&self, key: &str) {
        let Some(cache) = &self.cache else {
            return;
        };
        if let Err(e) = self.cache_breaker.call(|| cache.delete(key)).await {
            warn!(key, error = %BusError::from_breaker("cache", e), "Failed to clear de-duplication key");
        }
    }

    /// Clear the publish marks of a batch the publisher gave up on, so its
    /// events can be published again.
    async fn forget_dropped(&self, items: &[BatchItem]) {
        for item in items {
            if let Some(correlation_id) = &item.correlation_id {
                let key = self.dedup_key("published", &item.routing_key, correlation_id);
                self.forget(&key).await;
            }
        }
    }

    async fn settle(&self, delivery_tag: u64, ack: bool) {
        let settled = if ack {
            self.channel.ack(delivery_tag).await
        } else {
            self.channel.nack(delivery_tag, false).await
        };
        if let Err(e) = settled {
            error!(delivery_tag, ack, error = %e, "Failed to settle delivery");
        }
    }

    /// Route an invalid event to the dead-letter exchange, bypassing retries.
    async fn reject_invalid(&self, delivery: &Delivery, queue: &str, reason: &ValidationError) {
        let mut message = OutboundMessage::new(
            &self.config.dead_letter_exchange,
            queue,
            delivery.body.clone(),
        );
        message.headers = delivery.headers.clone();
        message.correlation_id = delivery.correlation_id.clone();
        let message = message
            .with_content_type(CONTENT_TYPE_JSON)
            .with_header(REJECTION_REASON_HEADER, reason.to_string())
            .with_header(DEATH_QUEUE_HEADER, queue);

        match self.send(&message).await {
            Ok(()) => self.settle(delivery.delivery_tag, true).await,
            Err(e) => {
                warn!(queue, error = %e, "Could not dead-letter invalid event, rejecting it");
                self.settle(delivery.delivery_tag, false).await;
            }
        }
    }

    /// Remove a subscription: cancel its consumer, optionally unbind a durable
    /// queue, and wait for the dispatch loop to finish its current delivery.
    async fn stop(&self, event_type: &str, unbind: bool) -> Result<bool, BusError> {
        let Some((_, active)) = self.subscriptions.remove(event_type) else {
            return Ok(false);
        };
        let ActiveSubscription { info, mut task } = active;

        // Transient queues are deleted with their consumer, bindings included.
        let unbound = if unbind && info.durable {
            self.channel
                .unbind_queue(&info.queue, &self.config.exchange, &info.event_type)
                .await
        } else {
            Ok(())
        };
        let cancelled = self.channel.cancel(&info.consumer_tag).await;

        if tokio::time::timeout(STOP_GRACE, &mut task).await.is_err() {
            warn!(event_type, "Dispatch loop did not stop in time, aborting it");
            task.abort();
        }
        info!(event_type, queue = %info.queue, unbound = unbind && info.durable, "Subscription stopped");

        unbound?;
        cancelled?;
        Ok(true)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        for entry in self.subscriptions.iter() {
            entry.task.abort();
        }
    }
}

/// One subscription's dispatch loop.
struct Worker<T, H> {
    bus: Weak<Inner>,
    subscription: Subscription,
    breaker: Arc<CircuitBreaker>,
    handler: H,
    _event: PhantomData<fn() -> T>,
}

impl<T, H> Worker<T, H>
where
    T: DeserializeOwned + Send + 'static,
    H: EventHandler<T>,
{
    async fn run(self, mut deliveries: MessageStream) {
        while let Some(next) = deliveries.next().await {
            let Some(bus) = self.bus.upgrade() else {
                break;
            };
            match next {
                Ok(delivery) => self.dispatch(&bus, delivery).await,
                Err(e) => {
                    error!(
                        event_type = %self.subscription.event_type,
                        error = %e,
                        "Consumer stream failed"
                    );
                    break;
                }
            }
        }
        debug!(event_type = %self.subscription.event_type, "Dispatch loop stopped");
    }

    async fn dispatch(&self, bus: &Inner, delivery: Delivery) {
        let started = Instant::now();
        let event_type = self.subscription.event_type.as_str();

        let event = bus
            .validator
            .validate_bytes::<T>(&delivery.body)
            .and_then(|event| {
                if event.event_type() == event_type {
                    Ok(event)
                } else {
                    Err(ValidationError::TypeMismatch {
                        expected: event_type.to_string(),
                        actual: event.event_type().to_string(),
                    })
                }
            });
        let event = match event {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    event_type,
                    delivery_tag = delivery.delivery_tag,
                    error = %e,
                    "Rejecting invalid event"
                );
                bus.reject_invalid(&delivery, &self.subscription.queue, &e)
                    .await;
                bus.metrics
                    .record_event(event_type, started.elapsed(), false);
                return;
            }
        };

        let correlation_id = event.correlation_id().to_string();
        let dedup_key = self
            .subscription
            .use_cache
            .then(|| bus.dedup_key("processed", event_type, &correlation_id));
        if let Some(key) = &dedup_key
            && bus.seen(key).await
        {
            debug!(event_type, correlation_id, "Skipping event already processed");
            bus.metrics.record_duplicate(event_type);
            bus.settle(delivery.delivery_tag, true).await;
            return;
        }

        let outcome = self.breaker.call(|| self.handler.handle(event)).await;
        let elapsed = started.elapsed();
        match outcome {
            Ok(()) => {
                if let Some(key) = &dedup_key {
                    bus.remember(key).await;
                }
                bus.settle(delivery.delivery_tag, true).await;
                bus.metrics.record_event(event_type, elapsed, true);
                debug!(event_type, correlation_id, elapsed = ?elapsed, "Event handled");
            }
            Err(e) => {
                let error = BusError::from_breaker(
                    self.breaker.name(),
                    e.map(|handler_error| BusError::Handler {
                        event_type: event_type.to_string(),
                        message: handler_error.to_string(),
                    }),
                );
                warn!(
                    event_type,
                    correlation_id,
                    retry_count = delivery.retry_count(),
                    error = %error,
                    "Event handling failed"
                );
                bus.settle(delivery.delivery_tag, false).await;
                bus.metrics.record_event(event_type, elapsed, false);
            }
        }
    }
}
