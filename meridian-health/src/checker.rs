//! Aggregated health report.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use meridian_metrics::MetricsRegistry;
use serde::Serialize;
use tracing::warn;

use crate::indicator::{ComponentHealth, HealthIndicator, HealthStatus};

/// Report in the shape served by the health endpoint:
/// `{ status, details: { <component>: {...} }, timestamp }`.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub details: BTreeMap<String, ComponentHealth>,
    pub timestamp: DateTime<Utc>,
}

impl HealthReport {
    pub fn is_healthy(&self) -> bool {
        self.status.is_healthy()
    }

    pub fn component(&self, name: &str) -> Option<&ComponentHealth> {
        self.details.get(name)
    }
}

/// Runs every registered [`HealthIndicator`] concurrently, each bounded by
/// `probe_timeout`.
pub struct HealthChecker {
    indicators: Vec<Arc<dyn HealthIndicator>>,
    probe_timeout: Duration,
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthChecker {
    pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn new() -> Self {
        Self {
            indicators: Vec::new(),
            probe_timeout: Self::DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Adds a health indicator
    pub fn with_indicator(mut self, indicator: impl HealthIndicator + 'static) -> Self {
        self.indicators.push(Arc::new(indicator));
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn probe_timeout(&self) -> Duration {
        self.probe_timeout
    }

    /// Returns the number of registered indicators
    pub fn indicator_count(&self) -> usize {
        self.indicators.len()
    }

    /// Check every component. The report is unhealthy when any critical
    /// component is.
    pub async fn check(&self) -> HealthReport {
        let results = join_all(self.indicators.iter().map(|indicator| async move {
            let health = match tokio::time::timeout(self.probe_timeout, indicator.check()).await {
                Ok(health) => health,
                Err(_) => {
                    warn!(
                        component = indicator.name(),
                        timeout = ?self.probe_timeout,
                        "Health probe timed out"
                    );
                    indicator.unavailable(format!(
                        "health probe timed out after {:?}",
                        self.probe_timeout
                    ))
                }
            };
            (indicator.is_critical(), health)
        }))
        .await;

        let mut status = HealthStatus::Healthy;
        let mut details = BTreeMap::new();
        for (critical, health) in results {
            if critical && !health.status.is_healthy() {
                status = HealthStatus::Unhealthy;
            }
            details.insert(health.name.clone(), health);
        }

        HealthReport {
            status,
            details,
            timestamp: Utc::now(),
        }
    }

    /// Push queue and dead-letter depths observed by the indicators into `metrics`.
    pub async fn refresh_metrics(&self, metrics: &MetricsRegistry) {
        for indicator in &self.indicators {
            if tokio::time::timeout(self.probe_timeout, indicator.record_metrics(metrics))
                .await
                .is_err()
            {
                warn!(component = indicator.name(), "Metrics refresh timed out");
            }
        }
    }
}

impl std::fmt::Debug for HealthChecker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<&str> = self.indicators.iter().map(|i| i.name()).collect();
        f.debug_struct("HealthChecker")
            .field("indicators", &names)
            .field("probe_timeout", &self.probe_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct Fixed {
        name: &'static str,
        healthy: bool,
        critical: bool,
    }

    #[async_trait]
    impl HealthIndicator for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn check(&self) -> ComponentHealth {
            if self.healthy {
                ComponentHealth::healthy(self.name)
            } else {
                ComponentHealth::unhealthy(self.name)
            }
        }

        fn is_critical(&self) -> bool {
            self.critical
        }
    }

    struct Hanging;

    #[async_trait]
    impl HealthIndicator for Hanging {
        fn name(&self) -> &str {
            "hanging"
        }

        async fn check(&self) -> ComponentHealth {
            futures::future::pending().await
        }

        fn is_critical(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn test_empty_checker_is_healthy() {
        let report = HealthChecker::new().check().await;
        assert!(report.is_healthy());
        assert!(report.details.is_empty());
    }

    #[tokio::test]
    async fn test_only_critical_components_decide() {
        let checker = HealthChecker::new()
            .with_indicator(Fixed {
                name: "optional",
                healthy: false,
                critical: false,
            })
            .with_indicator(Fixed {
                name: "core",
                healthy: true,
                critical: true,
            });
        assert_eq!(checker.indicator_count(), 2);

        let report = checker.check().await;
        assert!(report.is_healthy());
        assert!(!report.component("optional").unwrap().status.is_healthy());

        let checker = checker.with_indicator(Fixed {
            name: "storage",
            healthy: false,
            critical: true,
        });
        assert_eq!(checker.check().await.status, HealthStatus::Unhealthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_timeout() {
        let checker = HealthChecker::new()
            .with_probe_timeout(Duration::from_millis(200))
            .with_indicator(Hanging);

        let started = tokio::time::Instant::now();
        let report = checker.check().await;

        assert_eq!(started.elapsed(), Duration::from_millis(200));
        assert!(!report.is_healthy());
        let hanging = report.component("hanging").unwrap();
        assert!(hanging.error.as_deref().unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn test_report_serialization() {
        let report = HealthChecker::new()
            .with_indicator(Fixed {
                name: "core",
                healthy: true,
                critical: true,
            })
            .check()
            .await;

        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["status"], "healthy");
        assert_eq!(json["details"]["core"], serde_json::json!({}));
        assert!(json["timestamp"].as_str().unwrap().contains('T'));
    }
}
