//! Message broker health.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use meridian_messaging::BrokerChannel;
use meridian_metrics::MetricsRegistry;
use serde::Serialize;
use tracing::debug;

use crate::indicator::{ComponentHealth, HealthIndicator};

/// Broker section of the health report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerHealth {
    pub connected: bool,
    pub exchange_available: bool,
    pub queues: Vec<QueueHealth>,
}

impl BrokerHealth {
    pub fn is_healthy(&self) -> bool {
        self.connected && self.exchange_available && self.queues.iter().all(|q| q.available)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueHealth {
    pub name: String,
    pub available: bool,
    pub message_count: u64,
    #[serde(skip)]
    pub dead_letter: bool,
}

/// Probes the broker channel, the bus exchange and the watched queues.
pub struct BrokerHealthIndicator {
    channel: Arc<dyn BrokerChannel>,
    exchange: String,
    queues: Vec<(String, bool)>,
}

impl BrokerHealthIndicator {
    pub fn new(channel: Arc<dyn BrokerChannel>, exchange: impl Into<String>) -> Self {
        Self {
            channel,
            exchange: exchange.into(),
            queues: Vec::new(),
        }
    }

    /// Watch a queue's availability and depth.
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push((queue.into(), false));
        self
    }

    /// Watch a dead-letter queue; its depth is reported as dead-letter depth.
    pub fn with_dead_letter_queue(mut self, queue: impl Into<String>) -> Self {
        self.queues.push((queue.into(), true));
        self
    }

    pub async fn probe(&self) -> BrokerHealth {
        if !self.channel.is_connected() {
            return self.disconnected();
        }

        let exchange_available = match self.channel.exchange_exists(&self.exchange).await {
            Ok(exists) => exists,
            Err(e) => {
                debug!(exchange = %self.exchange, error = %e, "Exchange probe failed");
                false
            }
        };

        let queues = join_all(self.queues.iter().map(|(name, dead_letter)| async move {
            match self.channel.queue_status(name).await {
                Ok(status) => QueueHealth {
                    name: name.clone(),
                    available: true,
                    message_count: status.message_count,
                    dead_letter: *dead_letter,
                },
                Err(e) => {
                    debug!(queue = %name, error = %e, "Queue probe failed");
                    QueueHealth {
                        name: name.clone(),
                        available: false,
                        message_count: 0,
                        dead_letter: *dead_letter,
                    }
                }
            }
        }))
        .await;

        BrokerHealth {
            connected: true,
            exchange_available,
            queues,
        }
    }

    fn disconnected(&self) -> BrokerHealth {
        BrokerHealth {
            connected: false,
            exchange_available: false,
            queues: self
                .queues
                .iter()
                .map(|(name, dead_letter)| QueueHealth {
                    name: name.clone(),
                    available: false,
                    message_count: 0,
                    dead_letter: *dead_letter,
                })
                .collect(),
        }
    }
}

#[async_trait]
impl HealthIndicator for BrokerHealthIndicator {
    fn name(&self) -> &str {
        "broker"
    }

    async fn check(&self) -> ComponentHealth {
        let health = self.probe().await;
        let result = if health.is_healthy() {
            ComponentHealth::healthy("broker")
        } else {
            ComponentHealth::unhealthy("broker")
        };
        result.with_details(&health)
    }

    fn unavailable(&self, error: String) -> ComponentHealth {
        ComponentHealth::unhealthy("broker")
            .with_details(&self.disconnected())
            .with_error(error)
    }

    fn is_critical(&self) -> bool {
        true
    }

    async fn record_metrics(&self, metrics: &MetricsRegistry) {
        let health = self.probe().await;
        for queue in health.queues.iter().filter(|q| q.available) {
            if queue.dead_letter {
                metrics.set_dead_letter_depth(&queue.name, queue.message_count);
            } else {
                metrics.set_queue_depth(&queue.name, queue.message_count);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_messaging::{ExchangeConfig, MemoryBroker, OutboundMessage, QueueConfig};

    async fn setup() -> (MemoryBroker, Arc<dyn BrokerChannel>) {
        let broker = MemoryBroker::new();
        let channel: Arc<dyn BrokerChannel> = Arc::new(broker.channel());
        channel
            .declare_exchange(&ExchangeConfig::topic("events"))
            .await
            .unwrap();
        channel.declare_queue(&QueueConfig::new("billing.PING")).await.unwrap();
        channel
            .bind_queue("billing.PING", "events", "PING")
            .await
            .unwrap();
        (broker, channel)
    }

    #[tokio::test]
    async fn test_healthy_broker_reports_depth() {
        let (_broker, channel) = setup().await;
        channel
            .publish(&OutboundMessage::new("events", "PING", b"{}".to_vec()))
            .await
            .unwrap();

        let indicator = BrokerHealthIndicator::new(channel, "events").with_queue("billing.PING");
        let health = indicator.probe().await;

        assert!(health.is_healthy());
        assert_eq!(health.queues[0].message_count, 1);
        assert!(indicator.check().await.status.is_healthy());
    }

    #[tokio::test]
    async fn test_missing_queue_and_exchange() {
        let (_broker, channel) = setup().await;
        let indicator = BrokerHealthIndicator::new(channel, "audit").with_queue("nope");
        let health = indicator.probe().await;

        assert!(health.connected);
        assert!(!health.exchange_available);
        assert!(!health.queues[0].available);
        assert!(!indicator.check().await.status.is_healthy());
    }

    #[tokio::test]
    async fn test_disconnected_broker() {
        let (broker, channel) = setup().await;
        broker.set_available(false);

        let indicator = BrokerHealthIndicator::new(channel, "events").with_queue("billing.PING");
        let json = serde_json::to_value(indicator.check().await).unwrap();

        assert_eq!(
            json,
            serde_json::json!({
                "connected": false,
                "exchangeAvailable": false,
                "queues": [{ "name": "billing.PING", "available": false, "messageCount": 0 }]
            })
        );
    }

    #[tokio::test]
    async fn test_record_metrics_splits_dead_letter_depth() {
        let (_broker, channel) = setup().await;
        channel
            .declare_queue(&QueueConfig::new("billing.PING.dead-letter"))
            .await
            .unwrap();
        channel
            .publish(&OutboundMessage::new("", "billing.PING.dead-letter", b"x".to_vec()))
            .await
            .unwrap();

        let metrics = MetricsRegistry::new("health_test").unwrap();
        BrokerHealthIndicator::new(channel, "events")
            .with_queue("billing.PING")
            .with_dead_letter_queue("billing.PING.dead-letter")
            .record_metrics(&metrics)
            .await;

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.queues["billing.PING"].depth, 0);
        assert_eq!(snapshot.queues["billing.PING.dead-letter"].dead_letter_depth, 1);
    }
}
