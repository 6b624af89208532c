//! In-memory event storage for testing and examples.
//!
//! Keeps all committed events in a single vector in commit order, which
//! doubles as the global ordering across streams. Identifiers are random
//! UUIDs.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use nonempty::NonEmpty;
use uuid::Uuid;

use crate::{
    message::{Event, EventStream, Id},
    storage::{EventStorage, StorageError},
};

/// Thread-safe in-memory event log.
#[derive(Clone, Default)]
pub struct InMemoryStorage {
    events: Arc<RwLock<Vec<Event>>>,
}

impl InMemoryStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total number of committed events, across all streams.
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.read().expect("in-memory storage lock poisoned").len()
    }
}

#[async_trait]
impl EventStorage for InMemoryStorage {
    async fn new_id(&self) -> Result<Id, StorageError> {
        Ok(Id::Text(Uuid::new_v4().to_string()))
    }

    #[tracing::instrument(skip(self, events), fields(event_count = events.len()))]
    async fn commit_events(&self, events: NonEmpty<Event>) -> Result<(), StorageError> {
        let mut log = self.events.write().expect("in-memory storage lock poisoned");
        log.extend(events);
        tracing::debug!(total = log.len(), "events appended to in-memory log");
        Ok(())
    }

    async fn aggregate_events(
        &self,
        aggregate_id: &Id,
        after_version: Option<u64>,
    ) -> Result<EventStream, StorageError> {
        let log = self.events.read().expect("in-memory storage lock poisoned");
        Ok(log
            .iter()
            .filter(|event| event.aggregate_id.as_ref() == Some(aggregate_id))
            .filter(|event| match after_version {
                Some(after) => event.aggregate_version.is_some_and(|version| version > after),
                None => true,
            })
            .cloned()
            .collect())
    }

    async fn saga_events(
        &self,
        saga_id: &Id,
        before_version: u64,
    ) -> Result<EventStream, StorageError> {
        let log = self.events.read().expect("in-memory storage lock poisoned");
        Ok(log
            .iter()
            .filter(|event| event.saga_id.as_ref() == Some(saga_id))
            .filter(|event| event.saga_version.is_some_and(|version| version < before_version))
            .cloned()
            .collect())
    }

    async fn events(&self, kinds: Option<&[String]>) -> Result<EventStream, StorageError> {
        let log = self.events.read().expect("in-memory storage lock poisoned");
        Ok(log
            .iter()
            .filter(|event| match kinds {
                Some(kinds) => kinds.contains(&event.kind),
                None => true,
            })
            .cloned()
            .collect())
    }
}
