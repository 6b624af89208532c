//! One-time filtered subscriptions.
//!
//! [`OnceSubscription`] listens on a set of message kinds and resolves with
//! the first delivery that passes its filter. The subscription tears itself
//! down on the first match: all kind registrations are removed before the
//! handler runs, and a `handled` flag arbitrates concurrent deliveries so
//! the handler is invoked at most once.
//!
//! Callers that stop caring before a match arrives should call
//! [`OnceSubscription::cancel`] (or just drop the subscription, which
//! cancels as a last resort) so the emitter is not left with dangling
//! listeners.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use thiserror::Error;
use tokio::sync::oneshot;

use crate::{
    bus::{Handler, MessageBus},
    message::Event,
};

/// Predicate applied to each delivery before it can resolve a subscription.
pub type Filter = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

/// Wrap a closure into a [`Filter`].
pub fn filter<F>(f: F) -> Filter
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Error resolving a one-time subscription.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OnceError {
    /// The subscription was cancelled before a matching event arrived.
    #[error("one-time subscription cancelled before a matching event arrived")]
    Cancelled,
}

struct OnceState {
    bus: Arc<dyn MessageBus>,
    /// Arbiter for concurrent deliveries: the first delivery to flip this
    /// owns teardown and resolution.
    handled: AtomicBool,
    registrations: Mutex<Vec<(String, Handler)>>,
    resolve: Mutex<Option<oneshot::Sender<Event>>>,
}

impl OnceState {
    fn teardown(&self) {
        let registrations = std::mem::take(
            &mut *self.registrations.lock().expect("once registration lock poisoned"),
        );
        for (kind, handler) in registrations {
            self.bus.off(&kind, &handler);
        }
    }
}

/// A pending one-time subscription.
///
/// Await the matching event with [`wait`](Self::wait), or abandon the
/// subscription with [`cancel`](Self::cancel).
pub struct OnceSubscription {
    receiver: Option<oneshot::Receiver<Event>>,
    state: Arc<OnceState>,
}

impl OnceSubscription {
    /// Subscribe to every kind in `kinds` on `bus`.
    ///
    /// On each delivery the filter (if any) is applied; the first passing
    /// delivery unsubscribes from all kinds, invokes `handler` (if any), and
    /// resolves the subscription with the event.
    pub(crate) fn subscribe(
        bus: Arc<dyn MessageBus>,
        kinds: &[&str],
        handler: Option<Handler>,
        filter: Option<Filter>,
    ) -> Self {
        let (sender, receiver) = oneshot::channel();
        let state = Arc::new(OnceState {
            bus,
            handled: AtomicBool::new(false),
            registrations: Mutex::new(Vec::new()),
            resolve: Mutex::new(Some(sender)),
        });

        let registrations: Vec<(String, Handler)> = kinds
            .iter()
            .map(|kind| {
                let state = Arc::clone(&state);
                let handler = handler.clone();
                let filter = filter.clone();
                let subscriber: Handler = Arc::new(move |event: Event| {
                    let state = Arc::clone(&state);
                    let handler = handler.clone();
                    let filter = filter.clone();
                    Box::pin(async move {
                        if let Some(filter) = &filter {
                            if !filter(&event) {
                                return;
                            }
                        }
                        if state.handled.swap(true, Ordering::SeqCst) {
                            return;
                        }
                        state.teardown();
                        if let Some(handler) = handler {
                            handler(event.clone()).await;
                        }
                        if let Some(sender) =
                            state.resolve.lock().expect("once resolve lock poisoned").take()
                        {
                            let _ = sender.send(event);
                        }
                    })
                });
                ((*kind).to_string(), subscriber)
            })
            .collect();

        for (kind, subscriber) in &registrations {
            state.bus.on(kind, Arc::clone(subscriber));
        }
        *state.registrations.lock().expect("once registration lock poisoned") = registrations;

        // A delivery can slip in between `on` and the registration hand-off
        // above; if it already resolved, make sure teardown still runs.
        if state.handled.load(Ordering::SeqCst) {
            state.teardown();
        }

        Self {
            receiver: Some(receiver),
            state,
        }
    }

    /// Wait for the first matching event.
    ///
    /// # Errors
    ///
    /// Returns [`OnceError::Cancelled`] if the subscription was cancelled
    /// before a matching event arrived.
    pub async fn wait(mut self) -> Result<Event, OnceError> {
        let receiver = self.receiver.take().expect("receiver consumed only by wait");
        receiver.await.map_err(|_| OnceError::Cancelled)
    }

    /// Abandon the subscription, removing all its listeners.
    ///
    /// A no-op when the subscription already resolved.
    pub fn cancel(&self) {
        if !self.state.handled.swap(true, Ordering::SeqCst) {
            self.state.teardown();
            drop(self.state.resolve.lock().expect("once resolve lock poisoned").take());
        }
    }
}

impl Drop for OnceSubscription {
    fn drop(&mut self) {
        self.cancel();
    }
}
