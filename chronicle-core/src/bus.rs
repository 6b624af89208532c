//! Message transport abstraction.
//!
//! The runtime publishes committed events through a [`MessageBus`] and
//! subscribes command handlers, sagas, and projections on it. The default
//! in-memory implementation lives in [`inmemory`]; external transports
//! implement the trait themselves.
//!
//! Named queues are an optional capability: buses that do not support them
//! report [`BusError::UnsupportedCapability`] from [`MessageBus::queue`].

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::message::Event;

pub mod inmemory;

/// Type-erased asynchronous event handler.
///
/// Handlers are compared by pointer identity for unsubscription, so keep the
/// `Arc` returned by [`handler`] if you intend to call [`MessageBus::off`].
pub type Handler = Arc<dyn Fn(Event) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wrap an async closure into a [`Handler`].
pub fn handler<F, Fut>(f: F) -> Handler
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    Arc::new(move |event| Box::pin(f(event)))
}

/// Errors raised by bus operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The bus does not implement an optional capability.
    #[error("message bus does not support {0}")]
    UnsupportedCapability(&'static str),
    /// Delivery to the transport failed.
    #[error("publish failed: {0}")]
    Publish(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

/// Topic-style publish/subscribe transport.
///
/// `publish` delivers an event to every handler registered for the event's
/// kind. Delivery order across handlers is unspecified, but no handler ever
/// observes an event before `publish` is called for it.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register a handler for a message kind.
    fn on(&self, kind: &str, handler: Handler);

    /// Remove a previously registered handler.
    ///
    /// The handler is matched by pointer identity; passing a different
    /// closure wrapped around the same function is a no-op.
    fn off(&self, kind: &str, handler: &Handler);

    /// Deliver an event to all handlers registered for its kind.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::Publish`] when the transport fails to deliver.
    async fn publish(&self, event: Event) -> Result<(), BusError>;

    /// Obtain a named single-consumer queue view of this bus.
    ///
    /// Handlers registered through the returned bus form a consumer group:
    /// each matching event is delivered to exactly one handler in the group.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnsupportedCapability`] when the bus has no queue
    /// support. This is the default.
    fn queue(&self, name: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        let _ = name;
        Err(BusError::UnsupportedCapability("named queues"))
    }
}
