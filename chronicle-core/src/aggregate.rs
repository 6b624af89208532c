//! Command-side domain contract.
//!
//! Aggregates rebuild their state by replaying committed events, validate
//! commands in `handle`, and buffer the events they emit until the command
//! handler commits them. They are transient: one is constructed per command
//! and discarded afterwards.
//!
//! The [`EventLog`] helper owns the id/version/changes bookkeeping so that
//! emitted events always land on consecutive versions and carry the
//! aggregate's id.

use async_trait::async_trait;

use crate::message::{Command, Event, EventStream, Id};

/// Error produced by domain code: aggregate command handling, saga
/// application, and the factories that construct them.
pub type DomainError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// A command-side domain entity.
///
/// `handle` may suspend; everything else is synchronous bookkeeping. The
/// snapshot trio is optional: the default `should_take_snapshot` never asks
/// for one, and `make_snapshot` returning `None` while
/// `should_take_snapshot` returns `true` is reported as a contract violation
/// by the command handler.
#[async_trait]
pub trait Aggregate: Send {
    fn id(&self) -> &Id;

    /// Version of the last event applied or emitted; 0 for a fresh aggregate.
    fn version(&self) -> u64;

    /// Events emitted but not yet committed.
    fn changes(&self) -> EventStream;

    /// Validate a command against current state and emit resulting events.
    ///
    /// # Errors
    ///
    /// Returns a domain error when the command is invalid for the current
    /// state; nothing is committed in that case.
    async fn handle(&mut self, command: &Command) -> Result<(), DomainError>;

    /// Apply an event to aggregate state.
    ///
    /// Called both during replay and after emitting.
    fn mutate(&mut self, event: &Event);

    /// Whether the command handler should append a snapshot to this commit.
    fn should_take_snapshot(&self) -> bool {
        false
    }

    /// Produce a snapshot event capturing current state.
    fn make_snapshot(&self) -> Option<Event> {
        None
    }

    /// Restore state from a snapshot event during replay.
    fn restore_snapshot(&mut self, snapshot: &Event) {
        let _ = snapshot;
    }
}

/// Everything a factory needs to construct an aggregate.
///
/// For existing aggregates `events` holds the committed stream after the
/// snapshot (when one exists); for fresh aggregates both are empty.
pub struct AggregateContext {
    pub id: Id,
    pub snapshot: Option<Event>,
    pub events: EventStream,
}

impl AggregateContext {
    /// Replay this context onto a freshly constructed aggregate.
    ///
    /// The snapshot (standalone or embedded in the stream) goes through
    /// `restore_snapshot`; every other event goes through `mutate`, in order.
    pub fn replay(&self, aggregate: &mut dyn Aggregate) {
        if let Some(snapshot) = &self.snapshot {
            aggregate.restore_snapshot(snapshot);
        }
        for event in &self.events {
            if event.is_snapshot() {
                aggregate.restore_snapshot(event);
            } else {
                aggregate.mutate(event);
            }
        }
    }
}

/// Constructor for aggregates, handed to the command handler as a value.
pub type AggregateFactory = std::sync::Arc<
    dyn Fn(AggregateContext) -> Result<Box<dyn Aggregate>, DomainError> + Send + Sync,
>;

/// Identity, version, and uncommitted-changes bookkeeping for an aggregate.
///
/// Embed one in your aggregate and delegate `id`/`version`/`changes` to it.
/// `emit` stamps each event with the aggregate id and the next consecutive
/// version; `observe` keeps the version in step during replay.
#[derive(Clone, Debug)]
pub struct EventLog {
    id: Id,
    version: u64,
    changes: Vec<Event>,
}

impl EventLog {
    #[must_use]
    pub fn new(id: Id) -> Self {
        Self {
            id,
            version: 0,
            changes: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> &Id {
        &self.id
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    #[must_use]
    pub fn changes(&self) -> EventStream {
        self.changes.clone()
    }

    /// Emit an event at the next version, returning it for application.
    pub fn emit(&mut self, kind: impl Into<String>, payload: Option<serde_json::Value>) -> Event {
        self.version += 1;
        let event = Event {
            kind: kind.into(),
            aggregate_id: Some(self.id.clone()),
            aggregate_version: Some(self.version),
            payload,
            ..Event::default()
        };
        self.changes.push(event.clone());
        event
    }

    /// Track the version of a replayed event or restored snapshot.
    pub fn observe(&mut self, event: &Event) {
        if let Some(version) = event.aggregate_version {
            self.version = version;
        }
    }

    /// A snapshot event capturing the given payload at the current version.
    #[must_use]
    pub fn snapshot(&self, payload: serde_json::Value) -> Event {
        Event::snapshot(self.id.clone(), self.version, payload)
    }

    /// Drop buffered changes, as the event store does after commit.
    pub fn clear_changes(&mut self) {
        self.changes.clear();
    }
}
