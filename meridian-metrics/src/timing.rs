//! Processing-time aggregation.
//!
//! Prometheus histograms bucket samples but cannot answer min/max, which the
//! metrics contract asks for. `TimingStats` keeps the exact aggregate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Running count/total/min/max over recorded durations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TimingStats {
    count: u64,
    total: Duration,
    min: Option<Duration>,
    max: Option<Duration>,
}

impl TimingStats {
    /// Add one sample.
    pub fn record(&mut self, sample: Duration) {
        self.count += 1;
        self.total = self.total.saturating_add(sample);
        self.min = Some(self.min.map_or(sample, |m| m.min(sample)));
        self.max = Some(self.max.map_or(sample, |m| m.max(sample)));
    }

    /// Number of samples.
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Mean sample, or zero when empty.
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(n) => self.total / n,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    pub fn min(&self) -> Option<Duration> {
        self.min
    }

    pub fn max(&self) -> Option<Duration> {
        self.max
    }

    /// Serializable view in milliseconds.
    pub fn snapshot(&self) -> TimingSnapshot {
        TimingSnapshot {
            count: self.count,
            avg_ms: millis(self.average()),
            min_ms: self.min.map(millis).unwrap_or(0.0),
            max_ms: self.max.map(millis).unwrap_or(0.0),
        }
    }
}

/// Timing aggregate as reported to observability consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimingSnapshot {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
}

fn millis(d: Duration) -> f64 {
    d.as_secs_f64() * 1_000.0
}
