//! Integration tests for command execution against event-sourced aggregates.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc, Mutex,
};

use async_trait::async_trait;
use chronicle::{
    bus::{handler, inmemory::InMemoryBus, MessageBus},
    storage::{inmemory::InMemoryStorage, snapshot_inmemory::InMemorySnapshotStorage, EventStorage, StorageError},
    Aggregate, AggregateCommandHandler, AggregateContext, AggregateFactory, Command, CommandError,
    CommandHandler as _, DomainError, Event, EventLog, EventStore, EventStream, Id, Message,
    SnapshotStorage,
};
use nonempty::NonEmpty;

// ============================================================================
// Test Domain
// ============================================================================

#[derive(Clone, Copy, PartialEq, Eq)]
enum SnapshotMode {
    Off,
    /// Snapshot on every even, non-zero version.
    EveryEven,
    /// Claims to want snapshots but never produces one.
    Broken,
}

struct Widget {
    log: EventLog,
    count: u64,
    seen_payloads: Arc<Mutex<Vec<Option<serde_json::Value>>>>,
    snapshot_mode: SnapshotMode,
}

#[async_trait]
impl Aggregate for Widget {
    fn id(&self) -> &Id {
        self.log.id()
    }

    fn version(&self) -> u64 {
        self.log.version()
    }

    fn changes(&self) -> EventStream {
        self.log.changes()
    }

    async fn handle(&mut self, command: &Command) -> Result<(), DomainError> {
        match command.kind.as_str() {
            "createAggregate" => {
                let event = self.log.emit("created", None);
                self.mutate(&event);
                Ok(())
            }
            "doSomething" => {
                self.seen_payloads.lock().unwrap().push(command.payload.clone());
                let event = self.log.emit("somethingDone", command.payload.clone());
                self.mutate(&event);
                Ok(())
            }
            "doNothing" => Ok(()),
            other => Err(format!("widget cannot handle `{other}`").into()),
        }
    }

    fn mutate(&mut self, event: &Event) {
        self.log.observe(event);
        if event.kind == "somethingDone" {
            self.count += 1;
        }
    }

    fn should_take_snapshot(&self) -> bool {
        self.snapshot_mode != SnapshotMode::Off && self.version() % 2 == 0 && self.version() != 0
    }

    fn make_snapshot(&self) -> Option<Event> {
        match self.snapshot_mode {
            SnapshotMode::EveryEven => {
                Some(self.log.snapshot(serde_json::json!({ "count": self.count })))
            }
            SnapshotMode::Off | SnapshotMode::Broken => None,
        }
    }

    fn restore_snapshot(&mut self, snapshot: &Event) {
        self.log.observe(snapshot);
        self.count = snapshot
            .payload
            .as_ref()
            .and_then(|payload| payload.get("count"))
            .and_then(serde_json::Value::as_u64)
            .unwrap_or(0);
    }
}

fn widget_factory(
    seen_payloads: Arc<Mutex<Vec<Option<serde_json::Value>>>>,
    snapshot_mode: SnapshotMode,
) -> AggregateFactory {
    Arc::new(move |context: AggregateContext| {
        let mut widget = Widget {
            log: EventLog::new(context.id.clone()),
            count: 0,
            seen_payloads: Arc::clone(&seen_payloads),
            snapshot_mode,
        };
        context.replay(&mut widget);
        Ok(Box::new(widget) as Box<dyn Aggregate>)
    })
}

// ============================================================================
// Scripted storage double
// ============================================================================

/// Storage double with a fixed id, a fixed aggregate stream, and a record of
/// every committed batch.
struct ScriptedStorage {
    next_id: Id,
    id_calls: AtomicUsize,
    fixture: Vec<Event>,
    committed: Mutex<Vec<Vec<Event>>>,
}

impl ScriptedStorage {
    fn new(next_id: Id, fixture: Vec<Event>) -> Self {
        Self {
            next_id,
            id_calls: AtomicUsize::new(0),
            fixture,
            committed: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl EventStorage for ScriptedStorage {
    async fn new_id(&self) -> Result<Id, StorageError> {
        self.id_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.next_id.clone())
    }

    async fn commit_events(&self, events: NonEmpty<Event>) -> Result<(), StorageError> {
        self.committed.lock().unwrap().push(events.into_iter().collect());
        Ok(())
    }

    async fn aggregate_events(
        &self,
        _aggregate_id: &Id,
        _after_version: Option<u64>,
    ) -> Result<EventStream, StorageError> {
        Ok(self.fixture.clone())
    }

    async fn saga_events(
        &self,
        _saga_id: &Id,
        _before_version: u64,
    ) -> Result<EventStream, StorageError> {
        Ok(Vec::new())
    }

    async fn events(&self, _kinds: Option<&[String]>) -> Result<EventStream, StorageError> {
        Ok(Vec::new())
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn creating_an_aggregate_allocates_one_id_and_commits_one_event() {
    let storage = Arc::new(ScriptedStorage::new("a1".into(), Vec::new()));
    let store = Arc::new(EventStore::new(Arc::clone(&storage) as Arc<dyn EventStorage>));
    let handler = AggregateCommandHandler::new(
        store,
        widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::Off),
        ["createAggregate", "doSomething"],
    );

    let committed = handler.execute(Message::new("createAggregate")).await.unwrap();

    assert_eq!(storage.id_calls.load(Ordering::SeqCst), 1);
    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].kind, "created");
    assert_eq!(committed[0].aggregate_id, Some("a1".into()));
    assert_eq!(committed[0].aggregate_version, Some(1));

    let batches = storage.committed.lock().unwrap().clone();
    assert_eq!(batches.len(), 1);
    assert_eq!(batches[0], committed);
}

#[tokio::test]
async fn existing_aggregate_is_restored_before_the_command_runs() {
    let storage = Arc::new(ScriptedStorage::new(
        "unused".into(),
        vec![Message::event("aggregateCreated", "a1".into(), 1)],
    ));
    let store = Arc::new(EventStore::new(Arc::clone(&storage) as Arc<dyn EventStorage>));
    let seen_payloads = Arc::new(Mutex::new(Vec::new()));
    let handler = AggregateCommandHandler::new(
        store,
        widget_factory(Arc::clone(&seen_payloads), SnapshotMode::Off),
        ["createAggregate", "doSomething"],
    );

    let mut command = Message::new("doSomething").with_payload(serde_json::json!("p"));
    command.aggregate_id = Some("a1".into());
    let committed = handler.execute(command).await.unwrap();

    // The handler saw the command's payload, and no id was allocated.
    assert_eq!(
        seen_payloads.lock().unwrap().clone(),
        vec![Some(serde_json::json!("p"))]
    );
    assert_eq!(storage.id_calls.load(Ordering::SeqCst), 0);

    assert_eq!(committed.len(), 1);
    assert_eq!(committed[0].kind, "somethingDone");
    assert_eq!(committed[0].aggregate_version, Some(2));
}

#[tokio::test]
async fn snapshot_is_appended_once_the_trigger_version_is_reached() {
    let snapshots = Arc::new(InMemorySnapshotStorage::new());
    let bus = Arc::new(InMemoryBus::new());
    let published = Arc::new(Mutex::new(Vec::new()));
    for kind in ["somethingDone", "snapshot"] {
        let published = Arc::clone(&published);
        bus.on(
            kind,
            handler(move |event: Event| {
                let published = Arc::clone(&published);
                async move {
                    published.lock().unwrap().push(event);
                }
            }),
        );
    }

    let store = Arc::new(
        EventStore::new(Arc::new(InMemoryStorage::new()))
            .with_snapshot_storage(Arc::clone(&snapshots) as Arc<dyn SnapshotStorage>)
            .with_message_bus(bus)
            .with_sync_publish(),
    );
    let handler = Arc::new(AggregateCommandHandler::new(
        store,
        widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::EveryEven),
        ["doSomething"],
    ));

    // First command: version 1, no snapshot.
    let first = handler.execute(addressed("doSomething", "a1")).await.unwrap();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].aggregate_version, Some(1));
    assert!(snapshots.aggregate_snapshot(&"a1".into()).await.unwrap().is_none());

    // Second command: version 2, snapshot appended and persisted.
    let second = handler.execute(addressed("doSomething", "a1")).await.unwrap();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].aggregate_version, Some(2));

    let snapshot = snapshots.aggregate_snapshot(&"a1".into()).await.unwrap().unwrap();
    assert_eq!(snapshot.aggregate_version, Some(2));
    assert_eq!(snapshot.payload, Some(serde_json::json!({ "count": 2 })));

    // Published stream carries only the non-snapshot events.
    let kinds: Vec<String> = published
        .lock()
        .unwrap()
        .iter()
        .map(|event| event.kind.clone())
        .collect();
    assert_eq!(kinds, vec!["somethingDone".to_string(), "somethingDone".to_string()]);
}

#[tokio::test]
async fn commands_producing_no_events_commit_nothing() {
    let storage = Arc::new(InMemoryStorage::new());
    let snapshots = Arc::new(InMemorySnapshotStorage::new());
    let store = Arc::new(
        EventStore::new(Arc::clone(&storage) as Arc<dyn EventStorage>)
            .with_snapshot_storage(Arc::clone(&snapshots) as Arc<dyn SnapshotStorage>),
    );
    let handler = AggregateCommandHandler::new(
        store,
        widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::EveryEven),
        ["doNothing"],
    );

    let committed = handler.execute(addressed("doNothing", "a1")).await.unwrap();

    assert!(committed.is_empty());
    assert_eq!(storage.event_count(), 0);
    assert!(snapshots.aggregate_snapshot(&"a1".into()).await.unwrap().is_none());
}

#[tokio::test]
async fn snapshot_contract_violation_is_reported() {
    let store = Arc::new(
        EventStore::new(Arc::new(InMemoryStorage::new()))
            .with_snapshot_storage(Arc::new(InMemorySnapshotStorage::new())),
    );
    let handler = AggregateCommandHandler::new(
        store,
        widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::Broken),
        ["doSomething"],
    );

    handler.execute(addressed("doSomething", "a1")).await.unwrap();
    let result = handler.execute(addressed("doSomething", "a1")).await;

    assert!(matches!(result, Err(CommandError::SnapshotContractViolation)));
}

fn addressed(kind: &str, aggregate_id: &str) -> Command {
    let mut command = Message::new(kind);
    command.aggregate_id = Some(aggregate_id.into());
    command
}

// ============================================================================
// Replay and snapshot laws
// ============================================================================

#[tokio::test]
async fn replaying_the_committed_stream_reproduces_the_live_state() {
    let store = Arc::new(EventStore::new(Arc::new(InMemoryStorage::new())));
    let factory = widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::Off);
    let handler = AggregateCommandHandler::new(
        Arc::clone(&store),
        Arc::clone(&factory),
        ["createAggregate", "doSomething"],
    );

    let created = handler.execute(Message::new("createAggregate")).await.unwrap();
    let id = created[0].aggregate_id.clone().unwrap();
    handler.execute(addressed_id("doSomething", &id)).await.unwrap();
    let last = handler.execute(addressed_id("doSomething", &id)).await.unwrap();
    assert_eq!(last[0].aggregate_version, Some(3));

    // Rebuild from the full committed stream and compare with the live run:
    // two `somethingDone` events applied, version at the last committed one.
    let events = store.aggregate_events(&id).await.unwrap();
    let rebuilt = factory(AggregateContext {
        id: id.clone(),
        snapshot: None,
        events,
    })
    .unwrap();
    assert_eq!(rebuilt.version(), 3);
    assert!(rebuilt.changes().is_empty());
}

#[tokio::test]
async fn loading_from_a_snapshot_matches_loading_the_full_history() {
    let factory = widget_factory(Arc::new(Mutex::new(Vec::new())), SnapshotMode::EveryEven);

    let full_history = vec![
        Message::event("created", "a1".into(), 1),
        Message::event("somethingDone", "a1".into(), 2),
        Message::event("somethingDone", "a1".into(), 3),
    ];
    let from_history = factory(AggregateContext {
        id: "a1".into(),
        snapshot: None,
        events: full_history,
    })
    .unwrap();

    // Snapshot at version 2 captured count = 1.
    let from_snapshot = factory(AggregateContext {
        id: "a1".into(),
        snapshot: Some(Message::snapshot(
            "a1".into(),
            2,
            serde_json::json!({ "count": 1 }),
        )),
        events: vec![Message::event("somethingDone", "a1".into(), 3)],
    })
    .unwrap();

    assert_eq!(from_snapshot.version(), from_history.version());
    assert_eq!(
        from_snapshot.make_snapshot().unwrap().payload,
        from_history.make_snapshot().unwrap().payload
    );
}

fn addressed_id(kind: &str, id: &Id) -> Command {
    let mut command = Message::new(kind);
    command.aggregate_id = Some(id.clone());
    command
}
