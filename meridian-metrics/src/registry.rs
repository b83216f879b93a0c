//! The metrics registry shared by every Meridian component.

use crate::error::{MetricsError, Result};
use crate::snapshot::{
    CacheSnapshot, CircuitSnapshot, EventTypeSnapshot, MetricsSnapshot, PoolSnapshot,
    QueueSnapshot,
};
use crate::timing::TimingStats;
use dashmap::DashMap;
use prometheus::{CounterVec, GaugeVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::fmt;
use std::time::Duration;

/// Histogram buckets for event processing latency (in seconds).
pub const DEFAULT_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.075, 0.1, 0.25, 0.5, 0.75, 1.0, 2.5, 5.0, 7.5, 10.0,
];

/// Result of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheOutcome {
    Hit,
    Miss,
}

impl CacheOutcome {
    fn as_label(&self) -> &'static str {
        match self {
            CacheOutcome::Hit => "hit",
            CacheOutcome::Miss => "miss",
        }
    }
}

#[derive(Debug, Default)]
struct EventCounters {
    timing: TimingStats,
    success: u64,
    error: u64,
    duplicates: u64,
    published: u64,
}

/// Explicit, shareable metrics registry.
///
/// Every `record_*` call updates both the Prometheus collectors (for
/// [`export`](Self::export)) and the exact aggregates behind
/// [`snapshot`](Self::snapshot).
pub struct MetricsRegistry {
    namespace: String,
    registry: Registry,

    events_processed: CounterVec,
    event_duration: HistogramVec,
    events_duplicate: CounterVec,
    events_published: CounterVec,
    queue_depth: GaugeVec,
    dead_letter_depth: GaugeVec,
    cache_requests: CounterVec,
    circuit_state: GaugeVec,
    circuit_rejections: CounterVec,
    pool_connections: GaugeVec,
    pool_acquire_timeouts: CounterVec,
    batch_flushes: CounterVec,
    batch_dropped_items: CounterVec,

    events: DashMap<String, EventCounters>,
    queues: DashMap<String, QueueSnapshot>,
    cache: DashMap<String, (u64, u64)>,
    circuits: DashMap<String, CircuitSnapshot>,
    pools: DashMap<String, PoolSnapshot>,
}

impl MetricsRegistry {
    /// Create a registry whose metric names are prefixed with `namespace`.
    pub fn new(namespace: impl Into<String>) -> Result<Self> {
        let namespace = namespace.into();
        if !is_valid_namespace(&namespace) {
            return Err(MetricsError::InvalidNamespace(namespace));
        }
        let registry = Registry::new_custom(Some(namespace.clone()), None)?;

        let events_processed = counter_vec(
            &registry,
            "events_processed_total",
            "Events dispatched to handlers, by outcome",
            &["event_type", "outcome"],
        )?;
        let event_duration = {
            let opts = HistogramOpts::new(
                "event_processing_seconds",
                "Handler processing time per event type",
            )
            .buckets(DEFAULT_LATENCY_BUCKETS.to_vec());
            let histogram = HistogramVec::new(opts, &["event_type"])?;
            registry.register(Box::new(histogram.clone()))?;
            histogram
        };
        let events_duplicate = counter_vec(
            &registry,
            "events_duplicate_total",
            "Events skipped by the de-duplication window",
            &["event_type"],
        )?;
        let events_published = counter_vec(
            &registry,
            "events_published_total",
            "Events accepted by the broker, by publish mode",
            &["event_type", "mode"],
        )?;
        let queue_depth = gauge_vec(&registry, "queue_depth", "Messages ready per queue", &["queue"])?;
        let dead_letter_depth = gauge_vec(
            &registry,
            "dead_letter_depth",
            "Messages in the dead-letter queue",
            &["queue"],
        )?;
        let cache_requests = counter_vec(
            &registry,
            "cache_requests_total",
            "Cache lookups per service, by outcome",
            &["service", "outcome"],
        )?;
        let circuit_state = gauge_vec(
            &registry,
            "circuit_state",
            "Circuit breaker state (0 closed, 1 half-open, 2 open)",
            &["breaker"],
        )?;
        let circuit_rejections = counter_vec(
            &registry,
            "circuit_rejections_total",
            "Calls rejected by an open circuit",
            &["breaker"],
        )?;
        let pool_connections = gauge_vec(
            &registry,
            "pool_connections",
            "Pool connections by state",
            &["pool", "state"],
        )?;
        let pool_acquire_timeouts = counter_vec(
            &registry,
            "pool_acquire_timeouts_total",
            "Pool acquisitions that timed out waiting",
            &["pool"],
        )?;
        let batch_flushes = counter_vec(
            &registry,
            "batch_flushes_total",
            "Batch flush attempts, by outcome",
            &["exchange", "outcome"],
        )?;
        let batch_dropped_items = counter_vec(
            &registry,
            "batch_dropped_items_total",
            "Items dropped after batch retries were exhausted",
            &["exchange"],
        )?;

        Ok(Self {
            namespace,
            registry,
            events_processed,
            event_duration,
            events_duplicate,
            events_published,
            queue_depth,
            dead_letter_depth,
            cache_requests,
            circuit_state,
            circuit_rejections,
            pool_connections,
            pool_acquire_timeouts,
            batch_flushes,
            batch_dropped_items,
            events: DashMap::new(),
            queues: DashMap::new(),
            cache: DashMap::new(),
            circuits: DashMap::new(),
            pools: DashMap::new(),
        })
    }

    /// Metric name prefix.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Underlying Prometheus registry, for registering extra collectors.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Record one handler invocation.
    pub fn record_event(&self, event_type: &str, elapsed: Duration, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.events_processed
            .with_label_values(&[event_type, outcome])
            .inc();
        self.event_duration
            .with_label_values(&[event_type])
            .observe(elapsed.as_secs_f64());

        let mut entry = self.events.entry(event_type.to_string()).or_default();
        entry.timing.record(elapsed);
        if success {
            entry.success += 1;
        } else {
            entry.error += 1;
        }
    }

    /// Record an event skipped as already seen.
    pub fn record_duplicate(&self, event_type: &str) {
        self.events_duplicate.with_label_values(&[event_type]).inc();
        self.events.entry(event_type.to_string()).or_default().duplicates += 1;
    }

    /// Record an event accepted for publishing.
    pub fn record_published(&self, event_type: &str, batched: bool) {
        let mode = if batched { "batched" } else { "direct" };
        self.events_published
            .with_label_values(&[event_type, mode])
            .inc();
        self.events.entry(event_type.to_string()).or_default().published += 1;
    }

    pub fn set_queue_depth(&self, queue: &str, depth: u64) {
        self.queue_depth.with_label_values(&[queue]).set(depth as f64);
        self.queues.entry(queue.to_string()).or_default().depth = depth;
    }

    pub fn set_dead_letter_depth(&self, queue: &str, depth: u64) {
        self.dead_letter_depth
            .with_label_values(&[queue])
            .set(depth as f64);
        self.queues
            .entry(queue.to_string())
            .or_default()
            .dead_letter_depth = depth;
    }

    /// Record a cache lookup made on behalf of `service`.
    pub fn record_cache(&self, service: &str, outcome: CacheOutcome) {
        self.cache_requests
            .with_label_values(&[service, outcome.as_label()])
            .inc();
        let mut entry = self.cache.entry(service.to_string()).or_default();
        match outcome {
            CacheOutcome::Hit => entry.0 += 1,
            CacheOutcome::Miss => entry.1 += 1,
        }
    }

    /// Record a breaker state transition. `state` is `closed`, `half_open` or `open`.
    pub fn record_circuit_state(&self, breaker: &str, state: &str) {
        let value = match state {
            "closed" => 0.0,
            "half_open" => 1.0,
            "open" => 2.0,
            _ => -1.0,
        };
        self.circuit_state.with_label_values(&[breaker]).set(value);
        self.circuits.entry(breaker.to_string()).or_default().state = state.to_string();
    }

    pub fn record_circuit_rejection(&self, breaker: &str) {
        self.circuit_rejections.with_label_values(&[breaker]).inc();
        self.circuits
            .entry(breaker.to_string())
            .or_default()
            .rejections += 1;
    }

    /// Record the current occupancy of a connection pool.
    pub fn record_pool(&self, pool: &str, idle: usize, in_use: usize, waiting: usize) {
        for (state, value) in [("idle", idle), ("in_use", in_use), ("waiting", waiting)] {
            self.pool_connections
                .with_label_values(&[pool, state])
                .set(value as f64);
        }
        let mut entry = self.pools.entry(pool.to_string()).or_default();
        entry.idle = idle as u64;
        entry.in_use = in_use as u64;
        entry.waiting = waiting as u64;
    }

    pub fn record_pool_timeout(&self, pool: &str) {
        self.pool_acquire_timeouts.with_label_values(&[pool]).inc();
        self.pools
            .entry(pool.to_string())
            .or_default()
            .acquire_timeouts += 1;
    }

    pub fn record_batch_flush(&self, exchange: &str, success: bool) {
        let outcome = if success { "success" } else { "error" };
        self.batch_flushes
            .with_label_values(&[exchange, outcome])
            .inc();
    }

    pub fn record_batch_dropped(&self, exchange: &str, items: usize) {
        self.batch_dropped_items
            .with_label_values(&[exchange])
            .inc_by(items as f64);
    }

    /// Counters for one event type, if anything was recorded for it.
    pub fn event_type(&self, event_type: &str) -> Option<EventTypeSnapshot> {
        self.events.get(event_type).map(|c| event_snapshot(&c))
    }

    /// Point-in-time copy of every aggregate.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            events: self
                .events
                .iter()
                .map(|e| (e.key().clone(), event_snapshot(e.value())))
                .collect(),
            queues: self
                .queues
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            cache: self
                .cache
                .iter()
                .map(|e| {
                    let (hits, misses) = *e.value();
                    (e.key().clone(), CacheSnapshot::new(hits, misses))
                })
                .collect(),
            circuits: self
                .circuits
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
            pools: self
                .pools
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            timestamp: chrono::Utc::now(),
        }
    }

    /// Render every collector in Prometheus text format.
    pub fn export(&self) -> String {
        crate::export_from_registry(&self.registry)
    }
}

impl fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRegistry")
            .field("namespace", &self.namespace)
            .field("event_types", &self.events.len())
            .finish()
    }
}

fn event_snapshot(counters: &EventCounters) -> EventTypeSnapshot {
    EventTypeSnapshot {
        processing_time: counters.timing.snapshot(),
        success: counters.success,
        error: counters.error,
        duplicates: counters.duplicates,
        published: counters.published,
    }
}

fn counter_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<CounterVec> {
    let counter = CounterVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(counter.clone()))?;
    Ok(counter)
}

fn gauge_vec(registry: &Registry, name: &str, help: &str, labels: &[&str]) -> Result<GaugeVec> {
    let gauge = GaugeVec::new(Opts::new(name, help), labels)?;
    registry.register(Box::new(gauge.clone()))?;
    Ok(gauge)
}

fn is_valid_namespace(ns: &str) -> bool {
    let mut chars = ns.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_namespace() {
        assert!(matches!(
            MetricsRegistry::new("9lives"),
            Err(MetricsError::InvalidNamespace(_))
        ));
        assert!(MetricsRegistry::new("").is_err());
    }

    #[test]
    fn test_independent_registries() {
        let a = MetricsRegistry::new("svc").unwrap();
        let b = MetricsRegistry::new("svc").unwrap();
        a.record_event("PING", Duration::from_millis(1), true);
        assert!(a.event_type("PING").is_some());
        assert!(b.event_type("PING").is_none());
    }

    #[test]
    fn test_circuit_state_values() {
        let metrics = MetricsRegistry::new("svc").unwrap();
        metrics.record_circuit_state("broker", "open");
        metrics.record_circuit_rejection("broker");
        metrics.record_circuit_rejection("broker");

        let snap = metrics.snapshot();
        assert_eq!(snap.circuits["broker"].state, "open");
        assert_eq!(snap.circuits["broker"].rejections, 2);
        assert!(metrics.export().contains("svc_circuit_state{breaker=\"broker\"} 2"));
    }
}
