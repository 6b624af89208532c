//! In-memory snapshot storage.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;

use crate::{
    message::{Event, Id},
    snapshot::SnapshotStorage,
    storage::StorageError,
};

/// Latest-snapshot-per-aggregate map.
#[derive(Clone, Default)]
pub struct InMemorySnapshotStorage {
    snapshots: Arc<RwLock<HashMap<Id, Event>>>,
}

impl InMemorySnapshotStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SnapshotStorage for InMemorySnapshotStorage {
    async fn aggregate_snapshot(&self, aggregate_id: &Id) -> Result<Option<Event>, StorageError> {
        let snapshots = self.snapshots.read().expect("snapshot storage lock poisoned");
        Ok(snapshots.get(aggregate_id).cloned())
    }

    async fn save_aggregate_snapshot(&self, snapshot: Event) -> Result<(), StorageError> {
        let Some(aggregate_id) = snapshot.aggregate_id.clone() else {
            return Err(StorageError::new("snapshot carries no aggregate id"));
        };
        tracing::debug!(
            aggregate_id = %aggregate_id,
            aggregate_version = ?snapshot.aggregate_version,
            "snapshot saved"
        );
        self.snapshots
            .write()
            .expect("snapshot storage lock poisoned")
            .insert(aggregate_id, snapshot);
        Ok(())
    }
}
