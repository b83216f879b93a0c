//! Integration tests for meridian-metrics

use meridian_metrics::*;
use std::time::Duration;

#[test]
fn test_event_timing_and_outcomes() {
    let metrics = MetricsRegistry::new("test").unwrap();

    metrics.record_event("USER_CREATED", Duration::from_millis(10), true);
    metrics.record_event("USER_CREATED", Duration::from_millis(30), false);
    metrics.record_event("PING", Duration::from_millis(2), true);

    let snapshot = metrics.snapshot();
    let created = &snapshot.events["USER_CREATED"];
    assert_eq!(created.success, 1);
    assert_eq!(created.error, 1);
    assert_eq!(created.processing_time.count, 2);
    assert!((created.processing_time.min_ms - 10.0).abs() < 1e-6);
    assert!((created.processing_time.max_ms - 30.0).abs() < 1e-6);
    assert!((created.processing_time.avg_ms - 20.0).abs() < 1e-6);

    assert_eq!(snapshot.events["PING"].success, 1);
}

#[test]
fn test_duplicates_and_published() {
    let metrics = MetricsRegistry::new("test").unwrap();
    metrics.record_published("PING", false);
    metrics.record_published("PING", true);
    metrics.record_duplicate("PING");

    let ping = metrics.event_type("PING").unwrap();
    assert_eq!(ping.published, 2);
    assert_eq!(ping.duplicates, 1);
    assert_eq!(ping.success, 0);
}

#[test]
fn test_queue_and_dead_letter_depth() {
    let metrics = MetricsRegistry::new("test").unwrap();
    metrics.set_queue_depth("orders", 12);
    metrics.set_dead_letter_depth("orders", 3);
    metrics.set_queue_depth("orders", 7);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.queues["orders"].depth, 7);
    assert_eq!(snapshot.queues["orders"].dead_letter_depth, 3);
}

#[test]
fn test_cache_hit_ratio_per_service() {
    let metrics = MetricsRegistry::new("test").unwrap();
    for _ in 0..3 {
        metrics.record_cache("billing", CacheOutcome::Hit);
    }
    metrics.record_cache("billing", CacheOutcome::Miss);
    metrics.record_cache("search", CacheOutcome::Miss);

    let snapshot = metrics.snapshot();
    assert_eq!(snapshot.cache["billing"].hit_ratio, 0.75);
    assert_eq!(snapshot.cache["search"].hit_ratio, 0.0);
}

#[test]
fn test_pool_gauges() {
    let metrics = MetricsRegistry::new("test").unwrap();
    metrics.record_pool("redis", 2, 3, 1);
    metrics.record_pool_timeout("redis");

    let pool = metrics.snapshot().pools["redis"];
    assert_eq!(pool.idle, 2);
    assert_eq!(pool.in_use, 3);
    assert_eq!(pool.waiting, 1);
    assert_eq!(pool.acquire_timeouts, 1);
}

#[test]
fn test_export_prometheus_text() {
    let metrics = MetricsRegistry::new("meridian").unwrap();
    metrics.record_event("PING", Duration::from_millis(5), true);
    metrics.record_batch_flush("events", true);
    metrics.record_batch_dropped("events", 4);

    let text = metrics.export();
    assert!(text.contains("# HELP meridian_events_processed_total"));
    assert!(text.contains("meridian_events_processed_total{event_type=\"PING\",outcome=\"success\"} 1"));
    assert!(text.contains("meridian_event_processing_seconds_count{event_type=\"PING\"} 1"));
    assert!(text.contains("meridian_batch_dropped_items_total{exchange=\"events\"} 4"));
}

#[test]
fn test_snapshot_serializes() {
    let metrics = MetricsRegistry::new("test").unwrap();
    metrics.record_event("PING", Duration::from_millis(1), true);

    let json = serde_json::to_value(metrics.snapshot()).unwrap();
    assert_eq!(json["events"]["PING"]["success"], 1);
    assert!(json["events"]["PING"]["processingTime"]["avgMs"].is_number());
    assert!(json["timestamp"].is_string());
}
