//! In-memory message bus.
//!
//! Routes events directly to registered handlers without any transport
//! overhead, and supports named single-consumer queues with round-robin
//! delivery. Suitable for single-process deployments and tests.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, RwLock,
    },
};

use async_trait::async_trait;

use crate::{
    bus::{BusError, Handler, MessageBus},
    message::Event,
};

/// A consumer group behind a named queue.
///
/// Each matching event is handed to exactly one of the group's handlers,
/// selected round-robin.
struct QueueGroup {
    handlers: RwLock<Vec<Handler>>,
    cursor: AtomicUsize,
}

impl QueueGroup {
    fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
        }
    }

    fn next(&self) -> Option<Handler> {
        let handlers = self.handlers.read().expect("queue group lock poisoned");
        if handlers.is_empty() {
            return None;
        }
        let index = self.cursor.fetch_add(1, Ordering::Relaxed) % handlers.len();
        Some(Arc::clone(&handlers[index]))
    }
}

enum Subscriber {
    Direct(Handler),
    Group(Arc<QueueGroup>),
}

#[derive(Default)]
struct Inner {
    subscribers: HashMap<String, Vec<Subscriber>>,
    /// (queue name, message kind) -> group shared with `subscribers`.
    groups: HashMap<(String, String), Arc<QueueGroup>>,
}

/// In-memory topic bus with named queue support.
#[derive(Clone, Default)]
pub struct InMemoryBus {
    inner: Arc<RwLock<Inner>>,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of handlers currently registered for a kind, counting each
    /// queue-group member individually.
    #[must_use]
    pub fn handler_count(&self, kind: &str) -> usize {
        let inner = self.inner.read().expect("in-memory bus lock poisoned");
        inner.subscribers.get(kind).map_or(0, |subscribers| {
            subscribers
                .iter()
                .map(|subscriber| match subscriber {
                    Subscriber::Direct(_) => 1,
                    Subscriber::Group(group) => {
                        group.handlers.read().expect("queue group lock poisoned").len()
                    }
                })
                .sum()
        })
    }

    fn queue_on(&self, queue: &str, kind: &str, handler: Handler) {
        let mut inner = self.inner.write().expect("in-memory bus lock poisoned");
        let key = (queue.to_string(), kind.to_string());
        let group = match inner.groups.get(&key) {
            Some(group) => Arc::clone(group),
            None => {
                let group = Arc::new(QueueGroup::new());
                inner.groups.insert(key, Arc::clone(&group));
                inner
                    .subscribers
                    .entry(kind.to_string())
                    .or_default()
                    .push(Subscriber::Group(Arc::clone(&group)));
                group
            }
        };
        drop(inner);
        group
            .handlers
            .write()
            .expect("queue group lock poisoned")
            .push(handler);
    }

    fn queue_off(&self, queue: &str, kind: &str, handler: &Handler) {
        let inner = self.inner.read().expect("in-memory bus lock poisoned");
        if let Some(group) = inner.groups.get(&(queue.to_string(), kind.to_string())) {
            group
                .handlers
                .write()
                .expect("queue group lock poisoned")
                .retain(|registered| !Arc::ptr_eq(registered, handler));
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    fn on(&self, kind: &str, handler: Handler) {
        let mut inner = self.inner.write().expect("in-memory bus lock poisoned");
        inner
            .subscribers
            .entry(kind.to_string())
            .or_default()
            .push(Subscriber::Direct(handler));
    }

    fn off(&self, kind: &str, handler: &Handler) {
        let mut inner = self.inner.write().expect("in-memory bus lock poisoned");
        if let Some(subscribers) = inner.subscribers.get_mut(kind) {
            subscribers.retain(|subscriber| match subscriber {
                Subscriber::Direct(registered) => !Arc::ptr_eq(registered, handler),
                Subscriber::Group(_) => true,
            });
        }
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        // Snapshot the delivery targets under the read lock, then release it
        // before any handler runs: handlers may re-enter the bus.
        let targets: Vec<Handler> = {
            let inner = self.inner.read().expect("in-memory bus lock poisoned");
            inner.subscribers.get(&event.kind).map_or_else(Vec::new, |subscribers| {
                subscribers
                    .iter()
                    .filter_map(|subscriber| match subscriber {
                        Subscriber::Direct(handler) => Some(Arc::clone(handler)),
                        Subscriber::Group(group) => group.next(),
                    })
                    .collect()
            })
        };

        tracing::trace!(kind = %event.kind, targets = targets.len(), "delivering event");
        for target in targets {
            target(event.clone()).await;
        }
        Ok(())
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        Ok(Arc::new(InMemoryQueue {
            bus: self.clone(),
            name: name.to_string(),
        }))
    }
}

/// Named-queue view over an [`InMemoryBus`].
///
/// `on`/`off` manage membership of the queue's consumer group; `publish` and
/// `queue` forward to the parent bus.
struct InMemoryQueue {
    bus: InMemoryBus,
    name: String,
}

#[async_trait]
impl MessageBus for InMemoryQueue {
    fn on(&self, kind: &str, handler: Handler) {
        self.bus.queue_on(&self.name, kind, handler);
    }

    fn off(&self, kind: &str, handler: &Handler) {
        self.bus.queue_off(&self.name, kind, handler);
    }

    async fn publish(&self, event: Event) -> Result<(), BusError> {
        self.bus.publish(event).await
    }

    fn queue(&self, name: &str) -> Result<Arc<dyn MessageBus>, BusError> {
        self.bus.queue(name)
    }
}
