//! Serializable point-in-time view of a [`MetricsRegistry`](crate::MetricsRegistry).
//!
//! Snapshots are eventually consistent: each map is read independently while
//! writers keep recording.

use crate::timing::TimingSnapshot;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Everything the metrics contract exposes, keyed by label.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSnapshot {
    /// Per event type.
    pub events: BTreeMap<String, EventTypeSnapshot>,
    /// Per queue.
    pub queues: BTreeMap<String, QueueSnapshot>,
    /// Per cache-using service.
    pub cache: BTreeMap<String, CacheSnapshot>,
    /// Per breaker name.
    pub circuits: BTreeMap<String, CircuitSnapshot>,
    /// Per pool name.
    pub pools: BTreeMap<String, PoolSnapshot>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventTypeSnapshot {
    pub processing_time: TimingSnapshot,
    pub success: u64,
    pub error: u64,
    pub duplicates: u64,
    pub published: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueSnapshot {
    pub depth: u64,
    pub dead_letter_depth: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheSnapshot {
    pub hits: u64,
    pub misses: u64,
    /// `hits / (hits + misses)`, zero before the first lookup.
    pub hit_ratio: f64,
}

impl CacheSnapshot {
    pub(crate) fn new(hits: u64, misses: u64) -> Self {
        let total = hits + misses;
        let hit_ratio = if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64
        };
        Self {
            hits,
            misses,
            hit_ratio,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircuitSnapshot {
    pub state: String,
    pub rejections: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolSnapshot {
    pub idle: u64,
    pub in_use: u64,
    pub waiting: u64,
    pub acquire_timeouts: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_ratio() {
        assert_eq!(CacheSnapshot::new(0, 0).hit_ratio, 0.0);
        assert_eq!(CacheSnapshot::new(3, 1).hit_ratio, 0.75);
    }

    #[test]
    fn test_serializes_camel_case() {
        let snapshot = QueueSnapshot {
            depth: 2,
            dead_letter_depth: 1,
        };
        let json = serde_json::to_value(snapshot).unwrap();
        assert_eq!(json["deadLetterDepth"], 1);
    }
}
