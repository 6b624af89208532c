//! Read-side primitives.
//!
//! A [`Projection`] declares the event kinds it consumes and folds them into
//! a [`ProjectionView`]: a keyed read model with a readiness gate. The
//! [`ProjectionRuntime`] subscribes the projection on an event store,
//! replays history, marks the view ready, and then applies live events in
//! arrival order on a single worker task.

use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_stream::StreamExt as _;

use crate::{
    message::{Event, Id},
    store::{EventStore, StoreError},
};

/// Key-level failures of view mutations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ViewError {
    #[error("key {0} already exists in the view")]
    KeyExists(Id),
    #[error("key {0} is missing from the view")]
    KeyMissing(Id),
}

/// A keyed read model with a readiness gate.
///
/// The view is unready until its projection finishes initial replay; readers
/// using [`get`](Self::get) block until then. Mutations are atomic per key:
/// update callbacks run under the view lock.
pub struct ProjectionView<V> {
    records: Arc<RwLock<HashMap<Id, V>>>,
    ready: Arc<watch::Sender<bool>>,
}

impl<V> Clone for ProjectionView<V> {
    fn clone(&self) -> Self {
        Self {
            records: Arc::clone(&self.records),
            ready: Arc::clone(&self.ready),
        }
    }
}

impl<V> Default for ProjectionView<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> ProjectionView<V> {
    /// Create an unready view.
    #[must_use]
    pub fn new() -> Self {
        let (ready, _) = watch::channel(false);
        Self {
            records: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(ready),
        }
    }

    #[must_use]
    pub fn ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub(crate) fn mark_ready(&self) {
        self.ready.send_replace(true);
    }

    /// Wait until initial replay has completed.
    pub async fn once_ready(&self) {
        let mut ready = self.ready.subscribe();
        loop {
            if *ready.borrow_and_update() {
                return;
            }
            if ready.changed().await.is_err() {
                return;
            }
        }
    }

    #[must_use]
    pub fn has(&self, id: &Id) -> bool {
        self.records.read().expect("projection view lock poisoned").contains_key(id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().expect("projection view lock poisoned").len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert a new record.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::KeyExists`] when the key is already present.
    pub fn create(&self, id: Id, value: V) -> Result<(), ViewError> {
        let mut records = self.records.write().expect("projection view lock poisoned");
        if records.contains_key(&id) {
            return Err(ViewError::KeyExists(id));
        }
        records.insert(id, value);
        Ok(())
    }

    /// Replace an existing record with the callback's result.
    ///
    /// # Errors
    ///
    /// Returns [`ViewError::KeyMissing`] when the key is absent.
    pub fn update<F>(&self, id: &Id, update: F) -> Result<(), ViewError>
    where
        F: FnOnce(V) -> V,
    {
        let mut records = self.records.write().expect("projection view lock poisoned");
        let Some(current) = records.remove(id) else {
            return Err(ViewError::KeyMissing(id.clone()));
        };
        records.insert(id.clone(), update(current));
        Ok(())
    }

    /// Insert or replace: the callback receives the current value, if any.
    pub fn update_enforcing_new<F>(&self, id: Id, update: F)
    where
        F: FnOnce(Option<V>) -> V,
    {
        let mut records = self.records.write().expect("projection view lock poisoned");
        let current = records.remove(&id);
        records.insert(id, update(current));
    }

    /// Replace every record matching the filter with the callback's result.
    pub fn update_all<P, F>(&self, filter: P, update: F)
    where
        P: Fn(&V) -> bool,
        F: Fn(V) -> V,
    {
        let mut records = self.records.write().expect("projection view lock poisoned");
        let matching: Vec<Id> = records
            .iter()
            .filter(|(_, value)| filter(value))
            .map(|(id, _)| id.clone())
            .collect();
        for id in matching {
            if let Some(current) = records.remove(&id) {
                records.insert(id, update(current));
            }
        }
    }

    pub fn delete(&self, id: &Id) {
        self.records.write().expect("projection view lock poisoned").remove(id);
    }

    /// Remove every record matching the filter.
    pub fn delete_all<P>(&self, filter: P)
    where
        P: Fn(&V) -> bool,
    {
        self.records
            .write()
            .expect("projection view lock poisoned")
            .retain(|_, value| !filter(value));
    }
}

impl<V: Clone> ProjectionView<V> {
    /// Read a record once the view is ready.
    pub async fn get(&self, id: &Id) -> Option<V> {
        self.once_ready().await;
        self.try_get(id)
    }

    /// Read a record without waiting for readiness.
    #[must_use]
    pub fn try_get(&self, id: &Id) -> Option<V> {
        self.records.read().expect("projection view lock poisoned").get(id).cloned()
    }
}

/// A read model fed from the event stream.
#[async_trait]
pub trait Projection: Send + Sync + 'static {
    /// Record type stored in the view.
    type State: Send + Sync + 'static;

    /// The event kinds this projection consumes.
    fn handles(&self) -> Vec<String>;

    /// Fold one event into the view.
    async fn project(&self, view: &ProjectionView<Self::State>, event: &Event);
}

struct Job {
    event: Event,
    done: Option<oneshot::Sender<()>>,
}

/// Owns a projection's view and keeps it fed.
///
/// Construction subscribes to each handled kind, replays history in storage
/// order, marks the view ready, and leaves a worker task applying queued
/// live events in arrival order.
pub struct ProjectionRuntime<P: Projection> {
    view: ProjectionView<P::State>,
    jobs: mpsc::UnboundedSender<Job>,
}

impl<P: Projection> ProjectionRuntime<P> {
    /// Subscribe, replay, and go live.
    ///
    /// Live events arriving while replay is still running are queued and
    /// applied after it, in arrival order.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] when reading history fails.
    pub async fn start(projection: P, store: &EventStore) -> Result<Self, StoreError> {
        let projection = Arc::new(projection);
        let view = ProjectionView::new();
        let (jobs, mut queue) = mpsc::unbounded_channel::<Job>();

        let kinds = projection.handles();
        for kind in &kinds {
            let jobs = jobs.clone();
            store.on(
                kind,
                Arc::new(move |event: Event| {
                    let jobs = jobs.clone();
                    Box::pin(async move {
                        let _ = jobs.send(Job { event, done: None });
                    })
                }),
            );
        }

        let mut replayed: u64 = 0;
        let mut history = store.all_events(Some(&kinds)).await?;
        while let Some(event) = history.next().await {
            projection.project(&view, &event).await;
            replayed += 1;
        }
        view.mark_ready();
        tracing::debug!(replayed, "projection caught up");

        let worker_view = view.clone();
        let worker_projection = Arc::clone(&projection);
        tokio::spawn(async move {
            while let Some(job) = queue.recv().await {
                worker_projection.project(&worker_view, &job.event).await;
                if let Some(done) = job.done {
                    let _ = done.send(());
                }
            }
        });

        Ok(Self { view, jobs })
    }

    #[must_use]
    pub fn view(&self) -> &ProjectionView<P::State> {
        &self.view
    }

    /// Apply an event and wait until the view reflects it.
    pub async fn project(&self, event: Event) {
        let (done, applied) = oneshot::channel();
        if self.jobs.send(Job { event, done: Some(done) }).is_ok() {
            let _ = applied.await;
        }
    }

    /// Schedule an event for application and return immediately.
    pub fn project_nowait(&self, event: Event) {
        let _ = self.jobs.send(Job { event, done: None });
    }
}
