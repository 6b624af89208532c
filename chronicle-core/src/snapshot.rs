//! Snapshot persistence abstraction.
//!
//! Snapshots are regular [`Event`]s with the reserved `"snapshot"` kind,
//! capturing a restorable aggregate state image at a version. A store keeps
//! at most one snapshot per aggregate; saving replaces any prior one.

use async_trait::async_trait;

use crate::{
    message::{Event, Id},
    storage::StorageError,
};

pub mod inmemory;

/// Backend contract for latest-snapshot-per-aggregate storage.
#[async_trait]
pub trait SnapshotStorage: Send + Sync {
    /// The most recent snapshot for an aggregate, if any.
    async fn aggregate_snapshot(&self, aggregate_id: &Id) -> Result<Option<Event>, StorageError>;

    /// Persist a snapshot, replacing any prior one for the same aggregate.
    ///
    /// # Errors
    ///
    /// Fails when the snapshot carries no `aggregate_id`.
    async fn save_aggregate_snapshot(&self, snapshot: Event) -> Result<(), StorageError>;
}
