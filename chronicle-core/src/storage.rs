//! Durable event persistence abstraction.
//!
//! The runtime stores events through an [`EventStorage`] supplied by the
//! caller. Any durable log that can append a batch atomically and read it
//! back by aggregate, saga, or kind qualifies; [`inmemory`] provides the
//! reference implementation used in tests and examples.

use std::sync::Arc;

use async_trait::async_trait;
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    bus::MessageBus,
    message::{Event, EventStream, Id},
};

pub mod inmemory;

/// Error surfaced by a storage backend.
#[derive(Debug, Error)]
#[error(transparent)]
pub struct StorageError(Box<dyn std::error::Error + Send + Sync + 'static>);

impl StorageError {
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>) -> Self {
        Self(error.into())
    }
}

/// Backend contract for the durable event log.
///
/// Implementations must append each `commit_events` batch atomically: either
/// every event in the batch becomes durable, or none does. Batches are
/// [`NonEmpty`], so backends never need to handle the empty case.
///
/// All reads return events in commit order.
#[async_trait]
pub trait EventStorage: Send + Sync {
    /// Allocate a fresh identifier.
    async fn new_id(&self) -> Result<Id, StorageError>;

    /// Durably append a batch of events.
    async fn commit_events(&self, events: NonEmpty<Event>) -> Result<(), StorageError>;

    /// Events for one aggregate, optionally restricted to those with an
    /// `aggregate_version` strictly greater than `after_version`.
    ///
    /// The restriction is used for snapshot-based loading: events already
    /// captured by a snapshot are skipped.
    async fn aggregate_events(
        &self,
        aggregate_id: &Id,
        after_version: Option<u64>,
    ) -> Result<EventStream, StorageError>;

    /// Events for one saga with a `saga_version` strictly less than
    /// `before_version`.
    async fn saga_events(
        &self,
        saga_id: &Id,
        before_version: u64,
    ) -> Result<EventStream, StorageError>;

    /// All events across all aggregates, optionally filtered by kind.
    async fn events(&self, kinds: Option<&[String]>) -> Result<EventStream, StorageError>;

    /// Optional subscription surface exposed by the backend.
    ///
    /// When a backend can push committed events itself (for example through
    /// a change feed), it may hand the event store a bus to subscribe on.
    /// The event store then uses that bus for subscriptions only and never
    /// publishes to it.
    fn message_bus(&self) -> Option<Arc<dyn MessageBus>> {
        None
    }
}
