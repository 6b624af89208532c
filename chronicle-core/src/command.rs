//! Command routing and execution.
//!
//! The [`CommandBus`] routes commands by type to a registered
//! [`CommandHandler`]. [`AggregateCommandHandler`] is the built-in handler:
//! it rehydrates the target aggregate from its event stream (through a
//! snapshot when one exists), dispatches the command, and commits the
//! resulting events through the [`EventStore`].

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    aggregate::{AggregateContext, AggregateFactory, DomainError},
    message::{Command, EventStream, Id},
    store::{CommitError, EventStore, StoreError},
};

/// Errors raised while routing or executing a command.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid command: {0}")]
    InvalidCommand(&'static str),
    #[error("no handler registered for command `{0}`")]
    Unhandled(String),
    #[error("aggregate factory failed: {0}")]
    Factory(#[source] DomainError),
    #[error("aggregate rejected command: {0}")]
    Aggregate(#[source] DomainError),
    #[error("aggregate requested a snapshot but produced none")]
    SnapshotContractViolation,
    #[error(transparent)]
    Commit(#[from] CommitError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// A handler the command bus can route to.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    /// The command kinds this handler accepts.
    fn handles(&self) -> Vec<String>;

    /// Execute one command, returning the committed events.
    async fn execute(&self, command: Command) -> Result<EventStream, CommandError>;
}

/// Optional payload and context for [`CommandBus::send`].
#[derive(Clone, Debug, Default)]
pub struct SendOptions {
    pub payload: Option<serde_json::Value>,
    pub context: Option<serde_json::Value>,
}

/// Routes commands by type to their registered handler.
#[derive(Default)]
pub struct CommandBus {
    handlers: RwLock<HashMap<String, Arc<dyn CommandHandler>>>,
}

impl CommandBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for every command kind it reports.
    ///
    /// A later registration for the same kind replaces the earlier one.
    pub fn register(&self, handler: Arc<dyn CommandHandler>) {
        let kinds = handler.handles();
        let mut handlers = self.handlers.write().expect("command bus lock poisoned");
        for kind in kinds {
            tracing::debug!(command_kind = %kind, "command handler registered");
            handlers.insert(kind, Arc::clone(&handler));
        }
    }

    /// Build and dispatch a command addressed to one aggregate.
    ///
    /// # Errors
    ///
    /// See [`send_raw`](Self::send_raw).
    pub async fn send(
        &self,
        kind: &str,
        aggregate_id: Id,
        options: SendOptions,
    ) -> Result<EventStream, CommandError> {
        self.send_raw(Command {
            kind: kind.to_string(),
            aggregate_id: Some(aggregate_id),
            payload: options.payload,
            context: options.context,
            ..Command::default()
        })
        .await
    }

    /// Dispatch a fully formed command.
    ///
    /// # Errors
    ///
    /// Returns [`CommandError::InvalidCommand`] for a command without a type,
    /// [`CommandError::Unhandled`] when no handler is registered for it, or
    /// whatever the handler's execution raises.
    pub async fn send_raw(&self, command: Command) -> Result<EventStream, CommandError> {
        if command.kind.is_empty() {
            return Err(CommandError::InvalidCommand("command must carry a type"));
        }
        let handler = {
            let handlers = self.handlers.read().expect("command bus lock poisoned");
            handlers.get(&command.kind).cloned()
        };
        let Some(handler) = handler else {
            return Err(CommandError::Unhandled(command.kind));
        };
        handler.execute(command).await
    }
}

/// Executes commands against event-sourced aggregates.
///
/// Reentrant across distinct aggregates. Per-aggregate serialization is not
/// provided here; route commands through a named queue when concurrent
/// writers to one aggregate must be serialized.
pub struct AggregateCommandHandler {
    store: Arc<EventStore>,
    factory: AggregateFactory,
    handles: Vec<String>,
}

impl AggregateCommandHandler {
    pub fn new<I, K>(store: Arc<EventStore>, factory: AggregateFactory, handles: I) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            store,
            factory,
            handles: handles.into_iter().map(Into::into).collect(),
        }
    }

    /// Register this handler on a command bus for every kind it handles.
    pub fn subscribe(self: &Arc<Self>, bus: &CommandBus) {
        bus.register(Arc::clone(self) as Arc<dyn CommandHandler>);
    }
}

#[async_trait]
impl CommandHandler for AggregateCommandHandler {
    fn handles(&self) -> Vec<String> {
        self.handles.clone()
    }

    #[tracing::instrument(skip(self, command), fields(command_kind = %command.kind))]
    async fn execute(&self, command: Command) -> Result<EventStream, CommandError> {
        if command.kind.is_empty() {
            return Err(CommandError::InvalidCommand("command must carry a type"));
        }

        let mut aggregate = match &command.aggregate_id {
            Some(id) => {
                let mut events = self.store.aggregate_events(id).await?;
                let snapshot = if events.first().is_some_and(Command::is_snapshot) {
                    Some(events.remove(0))
                } else {
                    None
                };
                (self.factory)(AggregateContext {
                    id: id.clone(),
                    snapshot,
                    events,
                })
                .map_err(CommandError::Factory)?
            }
            None => {
                let id = self.store.new_id().await?;
                (self.factory)(AggregateContext {
                    id,
                    snapshot: None,
                    events: Vec::new(),
                })
                .map_err(CommandError::Factory)?
            }
        };

        aggregate.handle(&command).await.map_err(CommandError::Aggregate)?;

        let mut outgoing = aggregate.changes();
        if outgoing.is_empty() {
            tracing::debug!("command produced no events");
            return Ok(Vec::new());
        }

        if aggregate.should_take_snapshot() && self.store.snapshots_supported() {
            let snapshot = aggregate
                .make_snapshot()
                .ok_or(CommandError::SnapshotContractViolation)?;
            // Placed last so it reflects the aggregate's post-commit version.
            outgoing.push(snapshot);
        }

        Ok(self.store.commit(outgoing).await?)
    }
}
