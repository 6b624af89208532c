//! Sagas: long-running processes coordinating commands across aggregates.
//!
//! A saga is rehydrated from its event stream up to, but not including, the
//! triggering event, applies that event, and enqueues commands for the
//! [`CommandBus`]. The [`SagaEventHandler`] wires a saga factory to the
//! event store's subscription surface and drives the
//! rehydrate/apply/dispatch cycle. Handler errors are logged and never
//! propagate into bus delivery.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use crate::{
    aggregate::DomainError,
    bus::{BusError, Handler},
    command::{CommandBus, CommandError},
    message::{Command, Event, EventStream, Id},
    store::{EventStore, StoreError},
};

/// A long-running, event-driven process.
#[async_trait]
pub trait Saga: Send {
    /// The saga's identifier, once one is known.
    ///
    /// Fresh sagas started by a starter event have no id until the starter
    /// is applied.
    fn id(&self) -> Option<&Id>;

    /// Number of events applied so far.
    fn version(&self) -> u64;

    /// React to an event, possibly enqueueing commands.
    ///
    /// # Errors
    ///
    /// Returns a domain error when the event cannot be applied; the handler
    /// logs it and dispatches nothing.
    async fn apply(&mut self, event: &Event) -> Result<(), DomainError>;

    /// Commands enqueued but not yet dispatched.
    fn uncommitted_messages(&self) -> Vec<Command>;

    /// Empty the command buffer after dispatch.
    fn reset_uncommitted_messages(&mut self);

    /// React to a command-dispatch failure.
    ///
    /// May enqueue compensating commands; they are dispatched like any
    /// others. The default does nothing.
    async fn on_error(&mut self, error: &CommandError, event: &Event, command: &Command) {
        let _ = (error, event, command);
    }
}

/// Everything a factory needs to construct a saga.
///
/// `events` is the committed saga stream strictly before the triggering
/// event; it is empty for a saga being started.
pub struct SagaContext {
    pub id: Option<Id>,
    pub events: EventStream,
}

/// Constructor for sagas, handed to the event handler as a value.
pub type SagaFactory =
    Arc<dyn Fn(SagaContext) -> Result<Box<dyn Saga>, DomainError> + Send + Sync>;

/// Identity, version, and command-queue bookkeeping for a saga.
///
/// Embed one in your saga and delegate `id`/`version`/the queue accessors to
/// it. `observe` adopts the saga id from the first event that carries one
/// and counts applied events; `enqueue` stamps outgoing commands with the
/// saga's coordinates.
#[derive(Clone, Debug, Default)]
pub struct SagaLog {
    id: Option<Id>,
    version: u64,
    queue: Vec<Command>,
}

impl SagaLog {
    #[must_use]
    pub fn new(id: Option<Id>) -> Self {
        Self {
            id,
            version: 0,
            queue: Vec::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> Option<&Id> {
        self.id.as_ref()
    }

    #[must_use]
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Track an applied event.
    pub fn observe(&mut self, event: &Event) {
        if self.id.is_none() {
            self.id = event.saga_id.clone();
        }
        self.version += 1;
    }

    /// Enqueue a command carrying this saga's coordinates.
    pub fn enqueue(
        &mut self,
        kind: impl Into<String>,
        aggregate_id: Option<Id>,
        payload: Option<serde_json::Value>,
    ) {
        self.queue.push(Command {
            kind: kind.into(),
            aggregate_id,
            saga_id: self.id.clone(),
            saga_version: Some(self.version),
            payload,
            ..Command::default()
        });
    }

    #[must_use]
    pub fn uncommitted(&self) -> Vec<Command> {
        self.queue.clone()
    }

    pub fn reset(&mut self) {
        self.queue.clear();
    }
}

/// Errors raised while handling one saga event.
#[derive(Debug, Error)]
enum SagaDeliveryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("saga factory failed: {0}")]
    Factory(#[source] DomainError),
    #[error("saga rejected event: {0}")]
    Apply(#[source] DomainError),
}

/// Drives sagas off the published event stream.
pub struct SagaEventHandler {
    store: Arc<EventStore>,
    command_bus: Arc<CommandBus>,
    factory: SagaFactory,
    handles: Vec<String>,
    queue_name: Option<String>,
}

impl SagaEventHandler {
    pub fn new<I, K>(
        store: Arc<EventStore>,
        command_bus: Arc<CommandBus>,
        factory: SagaFactory,
        handles: I,
    ) -> Self
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
    {
        Self {
            store,
            command_bus,
            factory,
            handles: handles.into_iter().map(Into::into).collect(),
            queue_name: None,
        }
    }

    /// Subscribe through a named queue so a consumer group shares the load.
    #[must_use]
    pub fn with_queue(mut self, name: impl Into<String>) -> Self {
        self.queue_name = Some(name.into());
        self
    }

    /// Register this handler for every event kind the saga reacts to.
    ///
    /// # Errors
    ///
    /// Returns [`BusError::UnsupportedCapability`] when a queue name is
    /// configured but the bus has no named queue support.
    pub fn subscribe(self: &Arc<Self>) -> Result<(), BusError> {
        for kind in &self.handles {
            let this = Arc::clone(self);
            let subscriber: Handler = Arc::new(move |event: Event| {
                let this = Arc::clone(&this);
                Box::pin(async move {
                    this.process(event).await;
                })
            });
            match &self.queue_name {
                Some(name) => self.store.queue(name)?.on(kind, subscriber),
                None => self.store.on(kind, subscriber),
            }
        }
        Ok(())
    }

    /// Handle one published event, logging failures instead of raising them.
    pub async fn process(&self, event: Event) {
        if let Err(error) = self.deliver(&event).await {
            tracing::error!(%error, event_kind = %event.kind, "saga event handling failed");
        }
    }

    async fn deliver(&self, event: &Event) -> Result<(), SagaDeliveryError> {
        let mut saga = match &event.saga_id {
            Some(saga_id) => {
                let events = self.store.saga_events(saga_id, event).await?;
                (self.factory)(SagaContext {
                    id: Some(saga_id.clone()),
                    events,
                })
                .map_err(SagaDeliveryError::Factory)?
            }
            // No saga id: the event starts a new saga.
            None => (self.factory)(SagaContext {
                id: None,
                events: Vec::new(),
            })
            .map_err(SagaDeliveryError::Factory)?,
        };

        saga.apply(event).await.map_err(SagaDeliveryError::Apply)?;

        // Dispatch rounds continue while the saga keeps producing: commands
        // enqueued by `on_error` compensation re-enter the same path.
        loop {
            let commands = saga.uncommitted_messages();
            saga.reset_uncommitted_messages();
            if commands.is_empty() {
                break;
            }
            tracing::debug!(
                command_count = commands.len(),
                event_kind = %event.kind,
                "saga produced commands"
            );
            for command in commands {
                if let Err(error) = self.command_bus.send_raw(command.clone()).await {
                    tracing::warn!(
                        %error,
                        command_kind = %command.kind,
                        "saga command dispatch failed"
                    );
                    saga.on_error(&error, event, &command).await;
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::{message::Message, storage::inmemory::InMemoryStorage};

    /// Records applied events and enqueues one command per trigger.
    struct Relay {
        log: SagaLog,
        applied: Arc<Mutex<Vec<Event>>>,
        compensate: bool,
    }

    #[async_trait]
    impl Saga for Relay {
        fn id(&self) -> Option<&Id> {
            self.log.id()
        }

        fn version(&self) -> u64 {
            self.log.version()
        }

        async fn apply(&mut self, event: &Event) -> Result<(), DomainError> {
            self.log.observe(event);
            self.applied.lock().unwrap().push(event.clone());
            if event.kind == "orderPlaced" {
                self.log.enqueue("reserveStock", event.aggregate_id.clone(), None);
            }
            Ok(())
        }

        fn uncommitted_messages(&self) -> Vec<Command> {
            self.log.uncommitted()
        }

        fn reset_uncommitted_messages(&mut self) {
            self.log.reset();
        }

        async fn on_error(&mut self, _error: &CommandError, event: &Event, _command: &Command) {
            if self.compensate {
                self.compensate = false;
                self.log.enqueue("cancelOrder", event.aggregate_id.clone(), None);
            }
        }
    }

    fn relay_factory(applied: Arc<Mutex<Vec<Event>>>, compensate: bool) -> SagaFactory {
        Arc::new(move |context: SagaContext| {
            let mut relay = Relay {
                log: SagaLog::new(context.id.clone()),
                applied: Arc::clone(&applied),
                compensate,
            };
            for event in &context.events {
                relay.log.observe(event);
            }
            Ok(Box::new(relay) as Box<dyn Saga>)
        })
    }

    struct RecordingHandler {
        kinds: Vec<String>,
        received: Arc<Mutex<Vec<Command>>>,
        fail: bool,
    }

    #[async_trait]
    impl crate::command::CommandHandler for RecordingHandler {
        fn handles(&self) -> Vec<String> {
            self.kinds.clone()
        }

        async fn execute(&self, command: Command) -> Result<EventStream, CommandError> {
            self.received.lock().unwrap().push(command);
            if self.fail {
                Err(CommandError::InvalidCommand("rejected for the test"))
            } else {
                Ok(Vec::new())
            }
        }
    }

    fn harness(
        fail_dispatch: bool,
        compensate: bool,
    ) -> (Arc<SagaEventHandler>, Arc<Mutex<Vec<Command>>>, Arc<Mutex<Vec<Event>>>) {
        let store = Arc::new(EventStore::new(Arc::new(InMemoryStorage::new())));
        let command_bus = Arc::new(CommandBus::new());
        let received = Arc::new(Mutex::new(Vec::new()));
        command_bus.register(Arc::new(RecordingHandler {
            kinds: vec!["reserveStock".to_string(), "cancelOrder".to_string()],
            received: Arc::clone(&received),
            fail: fail_dispatch,
        }));

        let applied = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(SagaEventHandler::new(
            store,
            command_bus,
            relay_factory(Arc::clone(&applied), compensate),
            ["orderPlaced", "orderPaid"],
        ));
        (handler, received, applied)
    }

    #[tokio::test]
    async fn starter_event_creates_a_fresh_saga_and_dispatches() {
        let (handler, received, _) = harness(false, false);

        handler
            .process(Message::event("orderPlaced", "o1".into(), 1).with_saga("s1".into(), 0))
            .await;

        let commands = received.lock().unwrap().clone();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].kind, "reserveStock");
        assert_eq!(commands[0].saga_id, Some("s1".into()));
    }

    #[tokio::test]
    async fn saga_is_rehydrated_from_events_before_the_trigger() {
        let (handler, _, applied) = harness(false, false);

        // Commit prior saga history, then deliver a later event.
        handler
            .store
            .commit(vec![
                Message::event("orderPlaced", "o1".into(), 1).with_saga("s1".into(), 0),
            ])
            .await
            .unwrap();

        handler
            .process(Message::event("orderPaid", "o1".into(), 2).with_saga("s1".into(), 1))
            .await;

        // Only the trigger is applied live; history feeds rehydration.
        let events = applied.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, "orderPaid");
    }

    #[tokio::test]
    async fn dispatch_failure_invokes_compensation() {
        let (handler, received, _) = harness(true, true);

        handler
            .process(Message::event("orderPlaced", "o1".into(), 1).with_saga("s1".into(), 0))
            .await;

        let commands = received.lock().unwrap().clone();
        let kinds: Vec<&str> = commands.iter().map(|command| command.kind.as_str()).collect();
        assert_eq!(kinds, vec!["reserveStock", "cancelOrder"]);
    }

    #[tokio::test]
    async fn unroutable_saga_commands_do_not_propagate() {
        let store = Arc::new(EventStore::new(Arc::new(InMemoryStorage::new())));
        let command_bus = Arc::new(CommandBus::new());
        let applied = Arc::new(Mutex::new(Vec::new()));
        let handler = Arc::new(SagaEventHandler::new(
            store,
            command_bus,
            relay_factory(applied, false),
            ["orderPlaced"],
        ));

        // No handler registered for `reserveStock`; process must not panic.
        handler
            .process(Message::event("orderPlaced", "o1".into(), 1).with_saga("s1".into(), 0))
            .await;
    }
}
