//! Live change feeds for document stores.
//!
//! Every [`DocStore`](crate::DocStore) owns one [`ChangeFeed`]; writes
//! publish a [`ChangeEvent`] to every subscriber. A feed outlives individual
//! subscriptions and must be cancelled before its store is destroyed.

use serde_json::Value as Json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::warn;

const FEED_CAPACITY: usize = 256;

/// Where a write originated. Replication-applied writes are flagged so the
/// push direction of a link does not echo them back to the remote.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeOrigin {
    Local,
    Replication,
}

#[derive(Clone, Debug)]
pub struct ChangeEvent {
    /// Store-local monotonic sequence number of this write.
    pub seq: u64,
    pub id: String,
    pub deleted: bool,
    pub doc: Option<Json>,
    pub origin: ChangeOrigin,
}

struct FeedInner {
    tx: broadcast::Sender<ChangeEvent>,
    cancelled: AtomicBool,
}

/// Handle to a store's live change feed.
#[derive(Clone)]
pub struct ChangeFeed {
    inner: Arc<FeedInner>,
}

impl ChangeFeed {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(FEED_CAPACITY);
        Self {
            inner: Arc::new(FeedInner {
                tx,
                cancelled: AtomicBool::new(false),
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.inner.tx.subscribe()
    }

    /// Stop publishing. Required before the owning store is destroyed.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub(crate) fn publish(&self, event: ChangeEvent) {
        if !self.is_cancelled() {
            // Send only fails when there are no subscribers, which is fine.
            let _ = self.inner.tx.send(event);
        }
    }
}

impl Default for ChangeFeed {
    fn default() -> Self {
        Self::new()
    }
}

/// A spawned forwarder delivering feed events to a callback until cancelled.
///
/// Dropping the subscription also stops the forwarder.
pub struct ChangeSubscription {
    shutdown_tx: broadcast::Sender<()>,
}

impl ChangeSubscription {
    pub fn spawn<F>(feed: &ChangeFeed, mut on_change: F) -> Self
    where
        F: FnMut(ChangeEvent) + Send + 'static,
    {
        let mut rx = feed.subscribe();
        let (shutdown_tx, mut shutdown_rx) = broadcast::channel(1);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    next = rx.recv() => match next {
                        Ok(event) => on_change(event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "change feed subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        Self { shutdown_tx }
    }

    /// Stop delivering events. Safe to call more than once.
    pub fn cancel(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    fn event(seq: u64, id: &str) -> ChangeEvent {
        ChangeEvent {
            seq,
            id: id.to_string(),
            deleted: false,
            doc: None,
            origin: ChangeOrigin::Local,
        }
    }

    #[tokio::test]
    async fn subscription_receives_until_cancelled() {
        let feed = ChangeFeed::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let sub = ChangeSubscription::spawn(&feed, move |ev| {
            seen2.lock().unwrap().push(ev.id);
        });

        feed.publish(event(1, "a"));
        feed.publish(event(2, "b"));

        for _ in 0..20 {
            if seen.lock().unwrap().len() == 2 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(*seen.lock().unwrap(), vec!["a".to_string(), "b".to_string()]);

        sub.cancel();
        sub.cancel(); // idempotent
        tokio::time::sleep(Duration::from_millis(20)).await;
        feed.publish(event(3, "c"));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_feed_drops_events() {
        let feed = ChangeFeed::new();
        let mut rx = feed.subscribe();
        feed.cancel();
        feed.publish(event(1, "a"));
        assert!(rx.try_recv().is_err());
    }
}
