//! Typed event bus with synchronous, in-order fan-out.
//!
//! Emission is a plain function-call fan-out over a snapshot of the
//! subscriber list: every handler runs synchronously, in subscription
//! order, before `emit` returns. Because the lock is released before any
//! handler runs, handlers may re-enter the bus freely (subscribe,
//! unsubscribe, emit).
//!
//! A handler returning an error is logged and does not stop delivery to
//! the remaining handlers.

use outpost_model::SyncEvent;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tracing::warn;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

type Handler = Arc<dyn Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SubscriptionId(u64);

#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

#[derive(Default)]
struct BusInner {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<(SubscriptionId, Handler)>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&SyncEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::SeqCst));
        let Ok(mut subscribers) = self.inner.subscribers.lock() else {
            return id;
        };
        subscribers.push((id, Arc::new(handler)));
        id
    }

    /// Remove a subscription. Idempotent; returns whether it was present.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let Ok(mut subscribers) = self.inner.subscribers.lock() else {
            return false;
        };
        let before = subscribers.len();
        subscribers.retain(|(sub_id, _)| *sub_id != id);
        subscribers.len() != before
    }

    /// Deliver `event` to every subscriber, synchronously and in
    /// subscription order.
    pub fn emit(&self, event: SyncEvent) {
        let snapshot: Vec<Handler> = {
            let Ok(subscribers) = self.inner.subscribers.lock() else {
                return;
            };
            subscribers.iter().map(|(_, h)| h.clone()).collect()
        };
        for handler in snapshot {
            if let Err(e) = handler(&event) {
                warn!(error = %e, "event handler failed; continuing delivery");
            }
        }
    }
}
