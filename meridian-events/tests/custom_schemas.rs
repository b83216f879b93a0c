//! Event types registered at runtime, outside the built-in catalog.

use std::sync::Arc;
use std::time::Duration;

use meridian_events::{
    BusConfig, Event, EventBus, EventHandlerError, FieldKind, PublishOptions, Schema,
    SchemaRegistry, SubscribeOptions, handler_fn,
};
use meridian_messaging::MemoryBroker;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::timeout;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InvoiceSent {
    invoice_id: String,
    amount: f64,
    lines: Vec<String>,
}

fn schemas() -> SchemaRegistry {
    let mut schemas = SchemaRegistry::new();
    schemas.register(
        "INVOICE_SENT",
        Schema::new()
            .required("invoiceId", FieldKind::Uuid)
            .required("amount", FieldKind::Number)
            .required("lines", FieldKind::array_of(FieldKind::String))
            .deny_additional_fields(),
        "2",
    );
    schemas
}

async fn bus(broker: &MemoryBroker) -> EventBus {
    EventBus::builder(Arc::new(broker.channel()))
        .schemas(schemas())
        .config(BusConfig::new("billing"))
        .build()
        .await
        .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_custom_type_round_trip() {
    let broker = MemoryBroker::new();
    let bus = bus(&broker).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    bus.subscribe_type(
        "INVOICE_SENT",
        handler_fn(move |event: Event<InvoiceSent>| {
            let tx = tx.clone();
            async move { tx.send(event).map_err(|e| EventHandlerError::from(e.to_string())) }
        }),
        SubscribeOptions::default().transient().prefetch(1),
    )
    .await
    .unwrap();

    bus.publish_json(
        json!({
            "type": "INVOICE_SENT",
            "data": {
                "invoiceId": "8f14e45f-ceea-467f-a0e6-0a6e1c1e8b2a",
                "amount": 42.5,
                "lines": ["consulting"]
            }
        }),
        PublishOptions::default(),
    )
    .await
    .unwrap();

    let event = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
    assert_eq!(event.data().amount, 42.5);
    assert_eq!(event.data().lines, vec!["consulting".to_string()]);
    assert_eq!(event.metadata().schema_version, "2");
    assert_eq!(event.metadata().source, "billing");

    bus.close().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_custom_schema_rejects_extra_and_mistyped_fields() {
    let broker = MemoryBroker::new();
    let bus = bus(&broker).await;

    let err = bus
        .publish_json(
            json!({
                "type": "INVOICE_SENT",
                "data": {
                    "invoiceId": "8f14e45f-ceea-467f-a0e6-0a6e1c1e8b2a",
                    "amount": "42.5",
                    "lines": ["consulting", 7],
                    "discount": 5
                }
            }),
            PublishOptions::default(),
        )
        .await
        .unwrap_err();

    let message = err.to_string();
    assert!(message.contains("data.amount"), "{message}");
    assert!(message.contains("data.lines[1]"), "{message}");
    assert!(message.contains("data.discount"), "{message}");
}

#[tokio::test(start_paused = true)]
async fn test_catalog_types_are_unknown_without_the_catalog() {
    let broker = MemoryBroker::new();
    let bus = bus(&broker).await;

    let err = bus
        .publish_json(json!({ "type": "PING", "data": {} }), PublishOptions::default())
        .await
        .unwrap_err();
    assert_eq!(err.to_string(), "unknown event type 'PING'");
}
