//! RabbitMQ backend over `lapin`.
//!
//! Queue retry policy maps onto a companion `<queue>.retry` queue whose
//! message TTL is the retry delay and whose dead-letter target is the
//! original queue. A rejected delivery with retries left is re-published
//! there with its retry count bumped; once exhausted it is rejected and the
//! broker routes it to the queue's dead-letter exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties, options::*,
    publisher_confirm::PublisherConfirm,
    types::{AMQPValue, FieldTable},
};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::config::{ExchangeConfig, ExchangeKind, MessagingConfig, QueueConfig};
use crate::error::MessagingError;
use crate::message::{ConsumeOptions, Delivery, OutboundMessage, QueueStatus, RETRY_COUNT_HEADER};
use crate::traits::{BrokerChannel, MessageStream};

/// Name of the queue holding deliveries of `queue` that wait for redelivery.
pub fn retry_queue_name(queue: &str) -> String {
    format!("{}.retry", queue)
}

/// A connection to RabbitMQ
pub struct RabbitMqConnection {
    connection: Arc<Connection>,
    config: MessagingConfig,
}

impl RabbitMqConnection {
    /// Connect to RabbitMQ
    pub async fn connect(config: MessagingConfig) -> Result<Self, MessagingError> {
        config.validate()?;
        info!(timeout = ?config.connection_timeout, "Connecting to RabbitMQ");

        let connect = Connection::connect(&config.url, ConnectionProperties::default());
        let connection = tokio::time::timeout(config.connection_timeout, connect)
            .await
            .map_err(|_| MessagingError::Timeout(config.connection_timeout))??;

        info!("Connected to RabbitMQ successfully");
        Ok(Self {
            connection: Arc::new(connection),
            config,
        })
    }

    /// Open a channel with publisher confirms enabled.
    pub async fn channel(&self) -> Result<RabbitMqChannel, MessagingError> {
        let channel = self.connection.create_channel().await?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        channel
            .basic_qos(self.config.prefetch, BasicQosOptions::default())
            .await?;

        Ok(RabbitMqChannel {
            connection: Arc::clone(&self.connection),
            channel,
            confirm_timeout: self.config.confirm_timeout,
            queues: Mutex::new(HashMap::new()),
            inflight: Arc::new(Mutex::new(HashMap::new())),
            unconfirmed: Mutex::new(Vec::new()),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connection.status().connected()
    }

    pub async fn close(&self) -> Result<(), MessagingError> {
        info!("Closing RabbitMQ connection");
        self.connection
            .close(200, "Normal shutdown")
            .await
            .map_err(|e| MessagingError::Connection(e.to_string()))
    }
}

struct Inflight {
    queue: String,
    body: Vec<u8>,
    properties: BasicProperties,
}

/// A confirm-mode channel implementing [`BrokerChannel`].
pub struct RabbitMqChannel {
    connection: Arc<Connection>,
    channel: Channel,
    confirm_timeout: Duration,
    queues: Mutex<HashMap<String, QueueConfig>>,
    inflight: Arc<Mutex<HashMap<u64, Inflight>>>,
    unconfirmed: Mutex<Vec<PublisherConfirm>>,
}

impl RabbitMqChannel {
    fn build_properties(message: &OutboundMessage) -> BasicProperties {
        let mut props = BasicProperties::default()
            .with_message_id(message.message_id.clone().into())
            .with_timestamp(message.timestamp.timestamp() as u64);

        if let Some(ref content_type) = message.content_type {
            props = props.with_content_type(content_type.clone().into());
        }

        if let Some(ref correlation_id) = message.correlation_id {
            props = props.with_correlation_id(correlation_id.clone().into());
        }

        if message.persistent {
            props = props.with_delivery_mode(2);
        }

        if !message.headers.is_empty() {
            let mut headers = FieldTable::default();
            for (key, value) in &message.headers {
                headers.insert(key.clone().into(), AMQPValue::LongString(value.clone().into()));
            }
            props = props.with_headers(headers);
        }

        props
    }

    fn queue_arguments(config: &QueueConfig) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(dlx) = &config.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(dlx.clone().into()),
            );
        }
        if let Some(routing_key) = &config.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(routing_key.clone().into()),
            );
        }
        args
    }

    /// Open a throwaway channel for passive declares, which close the channel on failure.
    async fn probe_channel(&self) -> Result<Channel, MessagingError> {
        if !self.connection.status().connected() {
            return Err(MessagingError::Connection("connection is closed".into()));
        }
        Ok(self.connection.create_channel().await?)
    }

    async fn retry_later(&self, delivery_tag: u64, entry: Inflight) -> Result<(), MessagingError> {
        let retries = retry_count(&entry.properties);
        let mut headers = entry.properties.headers().clone().unwrap_or_default();
        headers.insert(
            RETRY_COUNT_HEADER.into(),
            AMQPValue::LongString((retries + 1).to_string().into()),
        );
        let properties = entry.properties.clone().with_headers(headers);

        let confirm = self
            .channel
            .basic_publish(
                "",
                &retry_queue_name(&entry.queue),
                BasicPublishOptions::default(),
                &entry.body,
                properties,
            )
            .await?
            .await?;
        if confirm.is_nack() {
            return Err(MessagingError::Confirm(format!(
                "retry of delivery {} was not confirmed",
                delivery_tag
            )));
        }

        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await?;
        debug!(queue = %entry.queue, attempt = retries + 1, "Delivery scheduled for retry");
        Ok(())
    }
}

fn retry_count(properties: &BasicProperties) -> u32 {
    let Some(headers) = properties.headers() else {
        return 0;
    };
    match headers.inner().get(RETRY_COUNT_HEADER) {
        Some(AMQPValue::LongString(s)) => s.to_string().parse().unwrap_or(0),
        _ => 0,
    }
}

fn to_delivery(delivery: &lapin::message::Delivery) -> Delivery {
    let props = &delivery.properties;
    let mut headers = HashMap::new();

    if let Some(amqp_headers) = props.headers() {
        for (key, value) in amqp_headers.inner() {
            if let AMQPValue::LongString(s) = value {
                headers.insert(key.to_string(), s.to_string());
            }
        }
    }

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        body: delivery.data.clone(),
        headers,
        message_id: props.message_id().as_ref().map(|s| s.to_string()),
        correlation_id: props.correlation_id().as_ref().map(|s| s.to_string()),
        redelivered: delivery.redelivered,
    }
}

#[async_trait]
impl BrokerChannel for RabbitMqChannel {
    async fn declare_exchange(&self, config: &ExchangeConfig) -> Result<(), MessagingError> {
        let kind = match config.kind {
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        self.channel
            .exchange_declare(
                &config.name,
                kind,
                ExchangeDeclareOptions {
                    durable: config.durable,
                    auto_delete: config.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;
        debug!(exchange = %config.name, "Exchange declared");
        Ok(())
    }

    async fn declare_queue(&self, config: &QueueConfig) -> Result<(), MessagingError> {
        let options = QueueDeclareOptions {
            durable: config.durable,
            auto_delete: config.auto_delete,
            exclusive: config.exclusive,
            ..Default::default()
        };
        self.channel
            .queue_declare(&config.name, options, Self::queue_arguments(config))
            .await?;

        if config.max_retries > 0 {
            let mut args = FieldTable::default();
            args.insert(
                "x-message-ttl".into(),
                AMQPValue::LongLongInt(config.retry_delay.as_millis() as i64),
            );
            args.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(config.name.clone().into()),
            );
            self.channel
                .queue_declare(
                    &retry_queue_name(&config.name),
                    QueueDeclareOptions {
                        durable: config.durable,
                        ..Default::default()
                    },
                    args,
                )
                .await?;
        }

        self.queues
            .lock()
            .insert(config.name.clone(), config.clone());
        debug!(queue = %config.name, max_retries = config.max_retries, "Queue declared");
        Ok(())
    }

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        debug!(queue, exchange, routing_key, "Queue bound to exchange");
        Ok(())
    }

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), MessagingError> {
        self.channel
            .queue_unbind(queue, exchange, routing_key, FieldTable::default())
            .await?;
        debug!(queue, exchange, routing_key, "Queue unbound from exchange");
        Ok(())
    }

    async fn publish(&self, message: &OutboundMessage) -> Result<(), MessagingError> {
        debug!(
            exchange = %message.exchange,
            routing_key = %message.routing_key,
            message_id = %message.message_id,
            "Publishing message"
        );
        let confirm = self
            .channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                Self::build_properties(message),
            )
            .await?;
        self.unconfirmed.lock().push(confirm);
        Ok(())
    }

    async fn wait_for_confirms(&self) -> Result<(), MessagingError> {
        let pending: Vec<PublisherConfirm> = std::mem::take(&mut *self.unconfirmed.lock());
        let confirms = async {
            let mut nacked = 0usize;
            for confirm in pending {
                if confirm.await?.is_nack() {
                    nacked += 1;
                }
            }
            Ok::<_, MessagingError>(nacked)
        };

        let nacked = tokio::time::timeout(self.confirm_timeout, confirms)
            .await
            .map_err(|_| MessagingError::Timeout(self.confirm_timeout))??;
        if nacked > 0 {
            return Err(MessagingError::Confirm(format!(
                "broker nacked {} published messages",
                nacked
            )));
        }
        Ok(())
    }

    async fn consume(&self, options: ConsumeOptions) -> Result<MessageStream, MessagingError> {
        if let Some(prefetch) = options.prefetch {
            self.channel
                .basic_qos(prefetch, BasicQosOptions::default())
                .await?;
        }

        let consumer = self
            .channel
            .basic_consume(
                &options.queue,
                &options.consumer_tag,
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await?;
        info!(queue = %options.queue, consumer_tag = %options.consumer_tag, "Consumer started");

        let inflight = Arc::clone(&self.inflight);
        let queue = options.queue;
        Ok(Box::pin(consumer.map(move |result| {
            let delivery = result?;
            inflight.lock().insert(
                delivery.delivery_tag,
                Inflight {
                    queue: queue.clone(),
                    body: delivery.data.clone(),
                    properties: delivery.properties.clone(),
                },
            );
            Ok(to_delivery(&delivery))
        })))
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<(), MessagingError> {
        self.channel
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        info!(consumer_tag, "Consumer cancelled");
        Ok(())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), MessagingError> {
        self.inflight.lock().remove(&delivery_tag);
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions::default())
            .await
            .map_err(|e| MessagingError::Acknowledge(e.to_string()))
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), MessagingError> {
        let entry = self.inflight.lock().remove(&delivery_tag);
        if requeue {
            self.channel
                .basic_nack(
                    delivery_tag,
                    BasicNackOptions {
                        requeue: true,
                        ..Default::default()
                    },
                )
                .await?;
            return Ok(());
        }

        let max_retries = entry
            .as_ref()
            .and_then(|e| self.queues.lock().get(&e.queue).map(|q| q.max_retries))
            .unwrap_or(0);
        if let Some(entry) = entry
            && retry_count(&entry.properties) < max_retries
        {
            return self.retry_later(delivery_tag, entry).await;
        }

        self.channel
            .basic_reject(delivery_tag, BasicRejectOptions { requeue: false })
            .await?;
        Ok(())
    }

    async fn queue_status(&self, queue: &str) -> Result<QueueStatus, MessagingError> {
        let probe = self.probe_channel().await?;
        let declared = probe
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if let Err(e) = probe.close(200, "OK").await {
            debug!(error = %e, "Probe channel already closed");
        }

        let declared = declared.map_err(|e| MessagingError::NotFound(format!("queue '{}': {}", queue, e)))?;
        Ok(QueueStatus {
            name: queue.to_string(),
            message_count: declared.message_count() as u64,
            consumer_count: declared.consumer_count(),
        })
    }

    async fn exchange_exists(&self, exchange: &str) -> Result<bool, MessagingError> {
        if exchange.is_empty() {
            return Ok(true);
        }
        let probe = self.probe_channel().await?;
        let declared = probe
            .exchange_declare(
                exchange,
                lapin::ExchangeKind::Topic,
                ExchangeDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await;
        if let Err(e) = probe.close(200, "OK").await {
            debug!(error = %e, "Probe channel already closed");
        }
        Ok(declared.is_ok())
    }

    fn is_connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn close(&self) -> Result<(), MessagingError> {
        let inflight = self.inflight.lock().len();
        if inflight > 0 {
            warn!(inflight, "Closing channel with unacknowledged deliveries");
        }
        self.channel.close(200, "Normal shutdown").await?;
        info!("RabbitMQ channel closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_queue_name() {
        assert_eq!(retry_queue_name("billing.PING"), "billing.PING.retry");
    }

    #[test]
    fn test_properties_carry_headers() {
        let message = OutboundMessage::new("events", "PING", b"{}".to_vec())
            .with_header(RETRY_COUNT_HEADER, "2")
            .with_correlation_id("c1");
        let props = RabbitMqChannel::build_properties(&message);
        assert_eq!(retry_count(&props), 2);
        assert_eq!(*props.delivery_mode(), Some(2));
    }

    #[tokio::test]
    #[ignore = "requires a running RabbitMQ server"]
    async fn test_rabbitmq_round_trip() {
        let connection = RabbitMqConnection::connect(MessagingConfig::from_env())
            .await
            .unwrap();
        let channel = connection.channel().await.unwrap();
        channel
            .declare_exchange(&ExchangeConfig::topic("meridian-test"))
            .await
            .unwrap();
        let queue = QueueConfig::new("meridian-test.ping").transient();
        channel.declare_queue(&queue).await.unwrap();
        channel
            .bind_queue(&queue.name, "meridian-test", "PING")
            .await
            .unwrap();

        channel
            .publish(&OutboundMessage::new("meridian-test", "PING", b"{}".to_vec()))
            .await
            .unwrap();
        channel.wait_for_confirms().await.unwrap();

        let mut stream = channel
            .consume(ConsumeOptions::new(&queue.name))
            .await
            .unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        channel.ack(delivery.delivery_tag).await.unwrap();
        channel.close().await.unwrap();
        connection.close().await.unwrap();
    }
}
