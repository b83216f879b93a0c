//! Event handlers

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EventHandlerError;
use crate::event::Event;

/// Handles validated events of one type.
///
/// A failed handler never stops its subscription: the delivery is
/// negatively acknowledged and the broker's retry policy takes over.
#[async_trait]
pub trait EventHandler<T>: Send + Sync + 'static {
    async fn handle(&self, event: Event<T>) -> Result<(), EventHandlerError>;
}

#[async_trait]
impl<T, H> EventHandler<T> for Arc<H>
where
    T: Send + 'static,
    H: EventHandler<T> + ?Sized,
{
    async fn handle(&self, event: Event<T>) -> Result<(), EventHandlerError> {
        (**self).handle(event).await
    }
}

/// Adapter turning an async closure into an [`EventHandler`]
pub struct FnHandler<F, T> {
    f: F,
    _event: PhantomData<fn(T)>,
}

/// Wrap an async closure as a handler.
///
/// ```rust
/// use meridian_events::{Event, EventHandlerError, Ping, handler_fn};
///
/// let handler = handler_fn(|event: Event<Ping>| async move {
///     tracing::info!(correlation_id = %event.correlation_id(), "pong");
///     Ok::<_, EventHandlerError>(())
/// });
/// # let _ = handler;
/// ```
pub fn handler_fn<F, T, Fut>(f: F) -> FnHandler<F, T>
where
    F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EventHandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _event: PhantomData,
    }
}

#[async_trait]
impl<F, T, Fut> EventHandler<T> for FnHandler<F, T>
where
    T: Send + 'static,
    F: Fn(Event<T>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), EventHandlerError>> + Send + 'static,
{
    async fn handle(&self, event: Event<T>) -> Result<(), EventHandlerError> {
        (self.f)(event).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::Ping;
    use std::sync::atomic::{AtomicU32, Ordering};

    struct Counting(AtomicU32);

    #[async_trait]
    impl EventHandler<Ping> for Counting {
        async fn handle(&self, _event: Event<Ping>) -> Result<(), EventHandlerError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_closure_handler() {
        let handler = handler_fn(|event: Event<Ping>| async move {
            match event.data().message.as_deref() {
                Some("fail") => Err(EventHandlerError::from("refused")),
                _ => Ok(()),
            }
        });

        let ok = Event::typed(Ping::default(), "test");
        assert!(handler.handle(ok).await.is_ok());

        let failing = Event::typed(
            Ping {
                message: Some("fail".into()),
            },
            "test",
        );
        let err = handler.handle(failing).await.unwrap_err();
        assert_eq!(err.to_string(), "Handler failed: refused");
    }

    #[tokio::test]
    async fn test_shared_handler() {
        let handler = Arc::new(Counting(AtomicU32::new(0)));
        let shared = Arc::clone(&handler);

        shared.handle(Event::typed(Ping::default(), "test")).await.unwrap();
        assert_eq!(handler.0.load(Ordering::SeqCst), 1);
    }
}
