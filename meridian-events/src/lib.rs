//! Validated, de-duplicated event distribution for Meridian
//!
//! This crate ties the broker, cache, breaker and metrics crates together
//! into a typed publish/subscribe bus.
//!
//! ## Features
//!
//! - **Envelope validation** - Every event carries `type`, `data` and
//!   `metadata` and is checked against the schema registered for its type
//! - **Idempotence** - Optional de-duplication of publishes and deliveries by
//!   correlation id, backed by the cache store
//! - **Resilience** - Broker, cache and handler calls run behind circuit breakers
//! - **Dead-lettering** - Failed deliveries are retried by the broker, then
//!   parked on a per-queue dead-letter queue
//! - **Batching** - Events can be buffered and published with one confirmation
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use meridian_events::*;
//! use meridian_messaging::MemoryBroker;
//! use meridian_redis::MemoryCache;
//!
//! # async fn example() -> Result<(), BusError> {
//! let broker = MemoryBroker::new();
//! let bus = EventBus::builder(Arc::new(broker.channel()))
//!     .cache(Arc::new(MemoryCache::new("accounts")))
//!     .config(BusConfig::new("accounts"))
//!     .build()
//!     .await?;
//!
//! bus.subscribe(
//!     handler_fn(|event: Event<UserCreated>| async move {
//!         tracing::info!(email = %event.data().email, "Welcome mail queued");
//!         Ok::<_, EventHandlerError>(())
//!     }),
//!     SubscribeOptions::default().with_cache(),
//! )
//! .await?;
//!
//! bus.publish(
//!     UserCreated {
//!         user_id: uuid::Uuid::new_v4(),
//!         email: "ana@example.com".into(),
//!         name: "Ana".into(),
//!         role: None,
//!     },
//!     PublishOptions::default().cached(),
//! )
//! .await?;
//!
//! bus.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Custom Event Types
//!
//! Types outside the built-in catalog are registered with a schema before
//! they can be published or subscribed to:
//!
//! ```rust
//! use meridian_events::{FieldKind, Schema, SchemaRegistry};
//!
//! let mut schemas = SchemaRegistry::with_catalog();
//! schemas.register(
//!     "INVOICE_SENT",
//!     Schema::new()
//!         .required("invoiceId", FieldKind::Uuid)
//!         .required("amount", FieldKind::Number),
//!     "1",
//! );
//! assert!(schemas.contains("INVOICE_SENT"));
//! ```

pub mod bus;
pub mod catalog;
pub mod config;
pub mod error;
pub mod event;
pub mod handler;
pub mod registry;
pub mod schema;
pub mod validator;

pub use bus::{
    EventBus, EventBusBuilder, PublishOptions, PublishOutcome, REJECTION_REASON_HEADER,
    SubscribeOptions, Subscription,
};
pub use catalog::{EventType, Ping, UserCreated, UserDeleted, UserUpdated};
pub use config::BusConfig;
pub use error::{
    BusError, ErrorKind, EventHandlerError, FieldError, FieldErrors, ValidationError,
};
pub use event::{ENVELOPE_VERSION, Event, EventMetadata, EventPayload};
pub use handler::{EventHandler, FnHandler, handler_fn};
pub use registry::SchemaRegistry;
pub use schema::{FieldKind, FieldSchema, Schema};
pub use validator::EventValidator;
