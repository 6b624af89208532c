//! The event store: validation, saga-id assignment, atomic save + publish,
//! and the subscription surface.
//!
//! [`EventStore`] sits between the durable [`EventStorage`] backend and the
//! [`MessageBus`]. A commit validates the batch, mints saga identifiers on
//! registered stream starters, persists events and at most one snapshot
//! concurrently, and only after both persists succeed publishes the events
//! in input order. A subscriber that observes an event can therefore rely on
//! it being durable.

use std::{
    collections::HashSet,
    pin::Pin,
    sync::{Arc, RwLock},
};

use futures::Stream;
use nonempty::NonEmpty;
use thiserror::Error;

use crate::{
    bus::{inmemory::InMemoryBus, BusError, Handler, MessageBus},
    message::{Event, EventStream, Id},
    snapshot::SnapshotStorage,
    storage::{EventStorage, StorageError},
    subscription::{Filter, OnceSubscription},
};

/// Lazy, finite, forward-only sequence of events.
///
/// Consumers iterate it once; whether a re-read hits storage again is up to
/// the backend.
pub type AllEvents = Pin<Box<dyn Stream<Item = Event> + Send + 'static>>;

/// Structural event validation failure.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("event is missing a type")]
    MissingKind,
    #[error("event `{kind}` must carry an aggregate id or a saga id")]
    MissingIdentity { kind: String },
    #[error("event `{kind}` carries a saga id but no saga version")]
    MissingSagaVersion { kind: String },
    /// Raised by caller-supplied validators.
    #[error("{0}")]
    Invalid(String),
}

/// Event validator applied to every non-snapshot event of a commit.
pub type Validator = Arc<dyn Fn(&Event) -> Result<(), ValidationError> + Send + Sync>;

/// The default validation rule: a non-empty type, at least one of
/// aggregate id / saga id, and a saga version whenever a saga id is set.
pub fn default_validator(event: &Event) -> Result<(), ValidationError> {
    if event.kind.is_empty() {
        return Err(ValidationError::MissingKind);
    }
    if event.aggregate_id.is_none() && event.saga_id.is_none() {
        return Err(ValidationError::MissingIdentity {
            kind: event.kind.clone(),
        });
    }
    if event.saga_id.is_some() && event.saga_version.is_none() {
        return Err(ValidationError::MissingSagaVersion {
            kind: event.kind.clone(),
        });
    }
    Ok(())
}

/// Errors raised by [`EventStore::commit`].
#[derive(Debug, Error)]
pub enum CommitError {
    #[error("invalid event: {0}")]
    InvalidEvent(#[from] ValidationError),
    #[error("commit carries more than one snapshot event")]
    MultipleSnapshots,
    #[error("commit carries a snapshot event but no snapshot storage is configured")]
    SnapshotsUnsupported,
    #[error("saga-starter event `{kind}` already belongs to saga {saga_id}")]
    SagaAlreadyStarted { kind: String, saga_id: Id },
    #[error("storage error: {0}")]
    Storage(#[source] StorageError),
    #[error("commit partially failed, event and snapshot storage disagree: {0}")]
    PartialFailure(#[source] StorageError),
    #[error("publish failed: {0}")]
    Publish(#[source] BusError),
}

/// Errors raised by the event store's read surface.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Coordinator for durable append and post-commit publication.
pub struct EventStore {
    storage: Arc<dyn EventStorage>,
    snapshots: Option<Arc<dyn SnapshotStorage>>,
    bus: Arc<dyn MessageBus>,
    /// False when the bus came from the storage backend's subscription
    /// surface: the backend pushes its own events, we only subscribe.
    publishes: bool,
    publish_async: bool,
    validator: Validator,
    saga_starters: RwLock<HashSet<String>>,
}

impl EventStore {
    /// Create a store over a storage backend.
    ///
    /// When the backend exposes its own subscription surface, that bus is
    /// used for subscriptions and the store never publishes; otherwise the
    /// built-in in-memory bus is used for both. Either choice can be
    /// overridden with [`with_message_bus`](Self::with_message_bus).
    #[must_use]
    pub fn new(storage: Arc<dyn EventStorage>) -> Self {
        let (bus, publishes) = match storage.message_bus() {
            Some(bus) => (bus, false),
            None => (Arc::new(InMemoryBus::new()) as Arc<dyn MessageBus>, true),
        };
        Self {
            storage,
            snapshots: None,
            bus,
            publishes,
            publish_async: true,
            validator: Arc::new(default_validator),
            saga_starters: RwLock::new(HashSet::new()),
        }
    }

    /// Enable snapshot support.
    #[must_use]
    pub fn with_snapshot_storage(mut self, snapshots: Arc<dyn SnapshotStorage>) -> Self {
        self.snapshots = Some(snapshots);
        self
    }

    /// Publish and subscribe through the supplied bus.
    #[must_use]
    pub fn with_message_bus(mut self, bus: Arc<dyn MessageBus>) -> Self {
        self.bus = bus;
        self.publishes = true;
        self
    }

    /// Await every publish during commit and surface publish errors.
    ///
    /// By default publication is scheduled after commit returns and publish
    /// errors are logged rather than surfaced.
    #[must_use]
    pub fn with_sync_publish(mut self) -> Self {
        self.publish_async = false;
        self
    }

    /// Replace the default event validator.
    #[must_use]
    pub fn with_validator(mut self, validator: Validator) -> Self {
        self.validator = validator;
        self
    }

    /// Whether a snapshot storage is configured.
    #[must_use]
    pub fn snapshots_supported(&self) -> bool {
        self.snapshots.is_some()
    }

    /// Allocate a fresh identifier from storage.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] when the backend fails.
    pub async fn new_id(&self) -> Result<Id, StoreError> {
        Ok(self.storage.new_id().await?)
    }

    /// The committed stream for one aggregate.
    ///
    /// When snapshot storage is configured and holds a snapshot for this
    /// aggregate, the returned stream begins with the snapshot event,
    /// followed by every event committed after the snapshot's version.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] when a backend fails.
    pub async fn aggregate_events(&self, aggregate_id: &Id) -> Result<EventStream, StoreError> {
        let snapshot = match &self.snapshots {
            Some(snapshots) => snapshots.aggregate_snapshot(aggregate_id).await?,
            None => None,
        };
        let after_version = snapshot.as_ref().and_then(|snapshot| snapshot.aggregate_version);
        let events = self.storage.aggregate_events(aggregate_id, after_version).await?;

        let mut stream = Vec::with_capacity(events.len() + 1);
        if let Some(snapshot) = snapshot {
            stream.push(snapshot);
        }
        stream.extend(events);
        Ok(stream)
    }

    /// Committed events for a saga, strictly before the triggering event.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::InvalidArgument`] when `before` carries no saga
    /// version, or [`StoreError::Storage`] when the backend fails.
    pub async fn saga_events(
        &self,
        saga_id: &Id,
        before: &Event,
    ) -> Result<EventStream, StoreError> {
        let before_version = before
            .saga_version
            .ok_or(StoreError::InvalidArgument("the anchor event must carry a saga version"))?;
        Ok(self.storage.saga_events(saga_id, before_version).await?)
    }

    /// Lazy sequence of events across all aggregates, optionally filtered by
    /// kind.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Storage`] when the backend fails.
    pub async fn all_events(&self, kinds: Option<&[String]>) -> Result<AllEvents, StoreError> {
        let events = self.storage.events(kinds).await?;
        Ok(Box::pin(tokio_stream::iter(events)))
    }

    /// Register event kinds whose commit mints a fresh saga identifier.
    ///
    /// Registration is idempotent: kinds already in the set are ignored.
    pub fn register_saga_starters<I, K>(&self, kinds: I)
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        let mut starters = self.saga_starters.write().expect("saga starter lock poisoned");
        starters.extend(kinds.into_iter().map(Into::into));
    }

    /// The currently registered saga-starter kinds, sorted.
    #[must_use]
    pub fn saga_starters(&self) -> Vec<String> {
        let starters = self.saga_starters.read().expect("saga starter lock poisoned");
        let mut kinds: Vec<String> = starters.iter().cloned().collect();
        kinds.sort();
        kinds
    }

    /// Subscribe a handler for an event kind on the underlying bus.
    pub fn on(&self, kind: &str, handler: Handler) {
        self.bus.on(kind, handler);
    }

    /// Remove a handler previously registered with [`on`](Self::on).
    pub fn off(&self, kind: &str, handler: &Handler) {
        self.bus.off(kind, handler);
    }

    /// A named single-consumer queue on the underlying bus.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnsupportedCapability`] when the bus has no named
    /// queue support.
    pub fn queue(&self, name: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        self.bus.queue(name)
    }

    /// One-time subscription resolving with the first event of any of the
    /// given kinds that passes `filter`.
    ///
    /// The optional `handler` runs once, before the subscription resolves.
    /// The returned [`OnceSubscription`] exposes `wait()` and `cancel()`.
    pub fn once(
        &self,
        kinds: &[&str],
        handler: Option<Handler>,
        filter: Option<Filter>,
    ) -> OnceSubscription {
        OnceSubscription::subscribe(Arc::clone(&self.bus), kinds, handler, filter)
    }

    /// Validate, persist, and publish a batch of events.
    ///
    /// See the module docs for the full algorithm. Returns the committed
    /// non-snapshot events; the snapshot (if any) is persisted through the
    /// snapshot storage and never published.
    ///
    /// # Errors
    ///
    /// Returns [`CommitError`] when validation fails, when snapshot use is
    /// malformed, when a saga-starter event already carries a saga id, when
    /// persistence fails, or (in synchronous publish mode only) when
    /// publication fails. A failed commit publishes nothing.
    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    pub async fn commit(&self, events: Vec<Event>) -> Result<EventStream, CommitError> {
        let (events, snapshot) = partition_snapshot(events)?;
        if snapshot.is_some() && self.snapshots.is_none() {
            return Err(CommitError::SnapshotsUnsupported);
        }
        for event in &events {
            (self.validator)(event)?;
        }
        let events = self.assign_saga_ids(events).await?;

        match (NonEmpty::from_vec(events.clone()), snapshot) {
            (None, None) => return Ok(Vec::new()),
            (Some(batch), None) => {
                self.storage.commit_events(batch).await.map_err(CommitError::Storage)?;
            }
            (None, Some(snapshot)) => {
                self.snapshot_storage()
                    .save_aggregate_snapshot(snapshot)
                    .await
                    .map_err(CommitError::Storage)?;
            }
            (Some(batch), Some(snapshot)) => {
                let (stored, snapshotted) = tokio::join!(
                    self.storage.commit_events(batch),
                    self.snapshot_storage().save_aggregate_snapshot(snapshot),
                );
                match (stored, snapshotted) {
                    (Ok(()), Ok(())) => {}
                    (Err(error), Err(_)) => return Err(CommitError::Storage(error)),
                    (Err(error), Ok(())) | (Ok(()), Err(error)) => {
                        return Err(CommitError::PartialFailure(error));
                    }
                }
            }
        }

        tracing::debug!(committed = events.len(), "commit durable");
        self.publish_committed(events.clone()).await?;
        Ok(events)
    }

    /// Panics only when called while a snapshot is known to be present, which
    /// `commit` guarantees by checking `snapshots.is_none()` first.
    fn snapshot_storage(&self) -> &Arc<dyn SnapshotStorage> {
        self.snapshots.as_ref().expect("snapshot storage checked before use")
    }

    /// Mint saga identifiers for registered starter events.
    async fn assign_saga_ids(&self, mut events: Vec<Event>) -> Result<Vec<Event>, CommitError> {
        let starters = {
            let starters = self.saga_starters.read().expect("saga starter lock poisoned");
            starters.clone()
        };
        if starters.is_empty() {
            return Ok(events);
        }
        for event in &mut events {
            if !starters.contains(&event.kind) {
                continue;
            }
            if let Some(saga_id) = &event.saga_id {
                return Err(CommitError::SagaAlreadyStarted {
                    kind: event.kind.clone(),
                    saga_id: saga_id.clone(),
                });
            }
            let saga_id = self.storage.new_id().await.map_err(CommitError::Storage)?;
            tracing::debug!(kind = %event.kind, %saga_id, "saga started");
            event.saga_id = Some(saga_id);
            event.saga_version = Some(0);
        }
        Ok(events)
    }

    /// Publish committed events in input order.
    ///
    /// Asynchronous mode schedules delivery after commit returns and logs
    /// failures; synchronous mode awaits every delivery and surfaces the
    /// first failure.
    async fn publish_committed(&self, events: Vec<Event>) -> Result<(), CommitError> {
        if !self.publishes || events.is_empty() {
            return Ok(());
        }
        if self.publish_async {
            let bus = Arc::clone(&self.bus);
            tokio::spawn(async move {
                for event in events {
                    if let Err(error) = bus.publish(event).await {
                        tracing::error!(%error, "failed to publish committed event");
                    }
                }
            });
            return Ok(());
        }
        for event in events {
            self.bus.publish(event).await.map_err(CommitError::Publish)?;
        }
        Ok(())
    }
}

/// Split out at most one snapshot event, preserving the order of the rest.
fn partition_snapshot(events: Vec<Event>) -> Result<(Vec<Event>, Option<Event>), CommitError> {
    let mut snapshot = None;
    let mut rest = Vec::with_capacity(events.len());
    for event in events {
        if event.is_snapshot() {
            if snapshot.is_some() {
                return Err(CommitError::MultipleSnapshots);
            }
            snapshot = Some(event);
        } else {
            rest.push(event);
        }
    }
    Ok((rest, snapshot))
}
