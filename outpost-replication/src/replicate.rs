//! Replication link lifecycle.
//!
//! [`replicate`] spawns a task that pulls (and, when push options are
//! present, pushes) document changes between a local store and a remote
//! store. The task emits [`ReplicationEvent`]s on a broadcast channel and
//! never surfaces errors to the caller: failures are events, retried with
//! back-off when the options say so.
//!
//! Event order for one link: zero or more `Active`, then `Paused` once the
//! initial pass has settled; in live mode further `Active`/`Paused` pairs
//! bracket each burst of changes.

use crate::remote::{RemoteChange, RemoteError, RemoteStore};
use outpost_model::ReplicateOptions;
use outpost_store::{ChangeOrigin, DocStore};
use rand::Rng;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// How often a live link polls the remote changes feed when idle.
const LIVE_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// First retry delay; grows by 1.5x per consecutive failure.
const RETRY_BASE_DELAY: Duration = Duration::from_secs(1);
const RETRY_MAX_DELAY: Duration = Duration::from_secs(30);

static NEXT_LINK_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Debug)]
pub enum ReplicationEvent {
    /// The link is transferring changes.
    Active,
    /// The link has caught up (the first one marks initial settlement).
    Paused,
    /// The remote refused the operation.
    Denied(String),
    /// Transfer failed. `unauthorized` marks an HTTP 401, i.e. "waiting on
    /// fresh credentials" rather than a visible failure.
    Error { message: String, unauthorized: bool },
}

/// Handle to a running replication link. Cloning shares the same link;
/// cancelling is idempotent and best-effort (an in-flight request may
/// complete, its results discarded).
#[derive(Clone)]
pub struct ReplicationHandle {
    link_id: u64,
    events: broadcast::Sender<ReplicationEvent>,
    shutdown: broadcast::Sender<()>,
    settled: Arc<AtomicBool>,
}

impl ReplicationHandle {
    /// Identity of this link; a fresh link always gets a fresh id.
    pub fn link_id(&self) -> u64 {
        self.link_id
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReplicationEvent> {
        self.events.subscribe()
    }

    /// Whether the initial pass has paused. Set before the first `Paused`
    /// event is sent, so a consumer that subscribes late can still observe
    /// settlement.
    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        let _ = self.shutdown.send(());
    }
}

impl std::fmt::Debug for ReplicationHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationHandle")
            .field("link_id", &self.link_id)
            .finish()
    }
}

/// Start a replication link between a local store and a remote store.
pub fn replicate(
    local: Arc<DocStore>,
    remote: Arc<dyn RemoteStore>,
    options: ReplicateOptions,
) -> ReplicationHandle {
    let (events, _) = broadcast::channel(64);
    let (shutdown, _) = broadcast::channel(1);
    let settled = Arc::new(AtomicBool::new(false));
    let handle = ReplicationHandle {
        link_id: NEXT_LINK_ID.fetch_add(1, Ordering::SeqCst),
        events: events.clone(),
        shutdown: shutdown.clone(),
        settled: settled.clone(),
    };

    let link_id = handle.link_id;
    let shutdown_rx = shutdown.subscribe();
    tokio::spawn(async move {
        let mut link = Link {
            local,
            remote,
            options,
            events,
            settled,
            pull_since: 0,
            push_since: 0,
        };
        debug!(link_id, store = %link.local.name(), remote = %link.remote.name(),
            "replication link started");
        link.run(shutdown_rx).await;
        debug!(link_id, store = %link.local.name(), "replication link stopped");
    });

    handle
}

struct Link {
    local: Arc<DocStore>,
    remote: Arc<dyn RemoteStore>,
    options: ReplicateOptions,
    events: broadcast::Sender<ReplicationEvent>,
    settled: Arc<AtomicBool>,
    pull_since: u64,
    push_since: u64,
}

impl Link {
    async fn run(&mut self, mut shutdown_rx: broadcast::Receiver<()>) {
        // Subscribe to the local feed before the initial scan so live push
        // cannot miss a write that lands between the two.
        let mut local_rx = self.local.changes().subscribe();

        // Initial pass: pull to caught-up, then push the local backlog.
        if !self.initial_pass(&mut shutdown_rx).await {
            return; // cancelled
        }
        self.settled.store(true, Ordering::SeqCst);
        let _ = self.events.send(ReplicationEvent::Paused);

        if !self.options.live {
            return;
        }

        let push_enabled = self.options.push.is_some();
        let mut poll = tokio::time::interval(LIVE_POLL_INTERVAL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => return,
                _ = poll.tick() => {
                    match self.pull_round().await {
                        Ok(true) => {
                            // A burst of pulled changes arrived; settle again
                            // once it has been applied.
                            let _ = self.events.send(ReplicationEvent::Paused);
                        }
                        Ok(false) => {}
                        Err(e) => {
                            self.report(&e);
                            if !self.options.retry {
                                return;
                            }
                            if !backoff_sleep(&mut shutdown_rx, 1).await {
                                return;
                            }
                        }
                    }
                }
                next = local_rx.recv(), if push_enabled => {
                    match next {
                        Ok(change) => {
                            if change.origin == ChangeOrigin::Local {
                                if let Err(e) = self.push_round().await {
                                    self.report(&e);
                                }
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            debug!(skipped, "replication push feed lagged; rescanning");
                            if let Err(e) = self.push_round().await {
                                self.report(&e);
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    }
                }
            }
        }
    }

    /// Pull until caught up, then push the backlog, retrying with back-off.
    /// Returns false when cancelled mid-pass.
    async fn initial_pass(&mut self, shutdown_rx: &mut broadcast::Receiver<()>) -> bool {
        let mut failures = 0u32;
        loop {
            match self.pull_to_caught_up().await {
                Ok(()) => break,
                Err(e) => {
                    self.report(&e);
                    if !self.options.retry {
                        // Settle anyway: the sync-state pair must close even
                        // when the first pass cannot reach the remote.
                        return true;
                    }
                    failures += 1;
                    if !backoff_sleep(shutdown_rx, failures).await {
                        return false;
                    }
                }
            }
        }

        if self.options.push.is_some() {
            let mut failures = 0u32;
            loop {
                match self.push_round().await {
                    Ok(_) => break,
                    Err(e) => {
                        self.report(&e);
                        if !self.options.retry {
                            return true;
                        }
                        failures += 1;
                        if !backoff_sleep(shutdown_rx, failures).await {
                            return false;
                        }
                    }
                }
            }
        }
        true
    }

    /// Keep pulling rounds until the remote reports nothing new.
    async fn pull_to_caught_up(&mut self) -> Result<(), RemoteError> {
        loop {
            let before = self.pull_since;
            self.pull_round().await?;
            if self.pull_since == before {
                return Ok(());
            }
        }
    }

    /// Pull at most `batches_limit` batches. Returns whether any change was
    /// applied.
    async fn pull_round(&mut self) -> Result<bool, RemoteError> {
        let skip_attachments = !self.options.pull.download_attachments;
        let mut applied_any = false;
        for _ in 0..self.options.batches_limit {
            let batch = self
                .with_timeout(self.remote.changes_since(
                    self.pull_since,
                    self.options.batch_size,
                    skip_attachments,
                ))
                .await?;

            if !batch.changes.is_empty() && !applied_any {
                applied_any = true;
                let _ = self.events.send(ReplicationEvent::Active);
            }
            for change in &batch.changes {
                let result = if change.deleted {
                    self.local.remove_replicated(&change.id)
                } else if let Some(doc) = &change.doc {
                    self.local.put_replicated(&change.id, doc)
                } else {
                    continue;
                };
                if let Err(e) = result {
                    warn!(store = %self.local.name(), id = %change.id, error = %e,
                        "failed to apply pulled change");
                }
            }
            if batch.last_seq > self.pull_since {
                self.pull_since = batch.last_seq;
            }
            if !batch.pending {
                break;
            }
        }
        Ok(applied_any)
    }

    /// Push the local backlog (local-origin writes only) to the remote.
    async fn push_round(&mut self) -> Result<bool, RemoteError> {
        let mut pushed_any = false;
        loop {
            let changes = match self
                .local
                .local_changes_since(self.push_since, self.options.batch_size)
            {
                Ok(changes) => changes,
                Err(e) => {
                    warn!(store = %self.local.name(), error = %e, "failed to scan local changes");
                    return Ok(pushed_any);
                }
            };
            if changes.is_empty() {
                return Ok(pushed_any);
            }
            if !pushed_any {
                pushed_any = true;
                let _ = self.events.send(ReplicationEvent::Active);
            }
            let last_seq = changes.last().map(|c| c.seq).unwrap_or(self.push_since);
            let docs: Vec<RemoteChange> = changes
                .into_iter()
                .map(|c| RemoteChange {
                    seq: c.seq,
                    id: c.id,
                    deleted: c.deleted,
                    doc: c.doc,
                })
                .collect();
            self.with_timeout(self.remote.push(docs)).await?;
            self.push_since = last_seq;
        }
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = Result<T, RemoteError>>,
    ) -> Result<T, RemoteError> {
        match tokio::time::timeout(Duration::from_millis(self.options.timeout_ms), fut).await {
            Ok(result) => result,
            Err(_) => Err(RemoteError::Network("request timed out".into())),
        }
    }

    fn report(&self, error: &RemoteError) {
        let event = match error {
            RemoteError::Unauthorized => ReplicationEvent::Error {
                message: error.to_string(),
                unauthorized: true,
            },
            RemoteError::Denied(reason) => ReplicationEvent::Denied(reason.clone()),
            _ => ReplicationEvent::Error {
                message: error.to_string(),
                unauthorized: false,
            },
        };
        let _ = self.events.send(event);
    }
}

/// Back off 1.5x per consecutive failure with a little jitter.
/// Returns false when cancelled during the sleep.
async fn backoff_sleep(shutdown_rx: &mut broadcast::Receiver<()>, failures: u32) -> bool {
    let mut delay = RETRY_BASE_DELAY.as_millis() as f64;
    for _ in 1..failures {
        delay *= 1.5;
    }
    let delay = delay.min(RETRY_MAX_DELAY.as_millis() as f64) as u64;
    let jitter = rand::thread_rng().gen_range(0..=delay / 4 + 1);
    tokio::select! {
        _ = shutdown_rx.recv() => false,
        _ = tokio::time::sleep(Duration::from_millis(delay + jitter)) => true,
    }
}
