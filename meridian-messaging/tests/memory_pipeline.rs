//! Batch publishing through the in-memory broker into consumers,
//! retry and dead-letter queues.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use meridian_messaging::*;

async fn next(stream: &mut MessageStream) -> Delivery {
    tokio::time::timeout(Duration::from_secs(1), stream.next())
        .await
        .expect("delivery within a second")
        .expect("stream open")
        .expect("delivery ok")
}

#[tokio::test]
async fn test_batch_retry_dead_letter_pipeline() {
    let broker = MemoryBroker::new();
    let channel: Arc<dyn BrokerChannel> = Arc::new(broker.channel());

    channel
        .declare_exchange(&ExchangeConfig::topic("events"))
        .await
        .unwrap();
    channel
        .declare_exchange(&ExchangeConfig::topic("events.dlx").with_kind(ExchangeKind::Fanout))
        .await
        .unwrap();

    let orders = QueueConfig::new("orders")
        .with_retries(1, Duration::ZERO)
        .with_dead_letter_exchange("events.dlx");
    let dead = QueueConfig::new(orders.dead_letter_queue_name());
    channel.declare_queue(&orders).await.unwrap();
    channel.declare_queue(&dead).await.unwrap();
    channel.bind_queue("orders", "events", "order.*").await.unwrap();
    channel.bind_queue(&dead.name, "events.dlx", "").await.unwrap();

    let publisher =
        BatchPublisher::new(Arc::clone(&channel), BatchConfig::new("events").batch_size(2))
            .unwrap();
    publisher
        .add(BatchItem::new("order.created", b"first".to_vec()))
        .await
        .unwrap();
    publisher
        .add(BatchItem::new("order.created", b"second".to_vec()).with_correlation_id("c2"))
        .await
        .unwrap();
    assert_eq!(publisher.stats().flushes, 1);
    assert_eq!(broker.depth("orders"), 2);

    let mut stream = channel.consume(ConsumeOptions::new("orders")).await.unwrap();

    let first = next(&mut stream).await;
    assert_eq!(first.body, b"first");
    assert_eq!(first.header(BATCH_SIZE_HEADER), Some("2"));
    channel.ack(first.delivery_tag).await.unwrap();

    let second = next(&mut stream).await;
    assert_eq!(second.retry_count(), 0);
    channel.nack(second.delivery_tag, false).await.unwrap();

    let retried = next(&mut stream).await;
    assert_eq!(retried.body, b"second");
    assert_eq!(retried.retry_count(), 1);
    assert!(retried.redelivered);
    channel.nack(retried.delivery_tag, false).await.unwrap();

    let dead_lettered = broker.get(&dead.name).expect("message dead-lettered");
    assert_eq!(dead_lettered.body, b"second");
    assert_eq!(dead_lettered.correlation_id.as_deref(), Some("c2"));
    assert_eq!(dead_lettered.header(DEATH_QUEUE_HEADER), Some("orders"));
    assert_eq!(broker.depth("orders"), 0);
    assert_eq!(broker.unacked(), 0);

    publisher.close().await.unwrap();
}

#[tokio::test]
async fn test_unrouted_batch_still_confirms() {
    let broker = MemoryBroker::new();
    let channel: Arc<dyn BrokerChannel> = Arc::new(broker.channel());
    channel
        .declare_exchange(&ExchangeConfig::topic("events"))
        .await
        .unwrap();

    let publisher = BatchPublisher::new(channel, BatchConfig::new("events")).unwrap();
    publisher
        .add(BatchItem::new("nobody.listens", b"x".to_vec()))
        .await
        .unwrap();

    assert_eq!(publisher.close().await.unwrap(), 1);
    assert!(publisher.is_closed());
    assert!(matches!(
        publisher.add(BatchItem::new("late", b"y".to_vec())).await,
        Err(BatchError::Closed)
    ));
}
