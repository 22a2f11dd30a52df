//! Sync-activity indicator plumbing.
//!
//! The application registers a [`SyncStatusSink`]; the engine pings it from
//! connection activity and from the remote request path. Up/down pings are
//! throttled so a busy link does not strobe the indicator.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How often at most the up/down indicators are pinged.
pub const THROTTLE_WINDOW: Duration = Duration::from_secs(7);

pub trait SyncStatusSink: Send + Sync {
    fn sync_up(&self);
    fn sync_down(&self);
    fn sync_error(&self);
    fn sync_denied(&self);
}

/// Sink that ignores everything; the default when no UI is attached.
pub struct NullStatusSink;

impl SyncStatusSink for NullStatusSink {
    fn sync_up(&self) {}
    fn sync_down(&self) {}
    fn sync_error(&self) {}
    fn sync_denied(&self) {}
}

/// Throttling front-end over a [`SyncStatusSink`].
pub struct ThrottledStatus {
    sink: Arc<dyn SyncStatusSink>,
    window: Duration,
    last_up: Mutex<Option<Instant>>,
    last_down: Mutex<Option<Instant>>,
}

impl ThrottledStatus {
    pub fn new(sink: Arc<dyn SyncStatusSink>) -> Self {
        Self::with_window(sink, THROTTLE_WINDOW)
    }

    pub fn with_window(sink: Arc<dyn SyncStatusSink>, window: Duration) -> Self {
        Self {
            sink,
            window,
            last_up: Mutex::new(None),
            last_down: Mutex::new(None),
        }
    }

    pub fn ping_up(&self) {
        if Self::should_fire(&self.last_up, self.window) {
            self.sink.sync_up();
        }
    }

    pub fn ping_down(&self) {
        if Self::should_fire(&self.last_down, self.window) {
            self.sink.sync_down();
        }
    }

    /// Errors are never throttled.
    pub fn ping_error(&self) {
        self.sink.sync_error();
    }

    pub fn ping_denied(&self) {
        self.sink.sync_denied();
    }

    fn should_fire(last: &Mutex<Option<Instant>>, window: Duration) -> bool {
        let Ok(mut last) = last.lock() else {
            return false;
        };
        let now = Instant::now();
        match *last {
            Some(previous) if now.duration_since(previous) < window => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSink {
        up: AtomicUsize,
        error: AtomicUsize,
    }

    impl SyncStatusSink for CountingSink {
        fn sync_up(&self) {
            self.up.fetch_add(1, Ordering::SeqCst);
        }
        fn sync_down(&self) {}
        fn sync_error(&self) {
            self.error.fetch_add(1, Ordering::SeqCst);
        }
        fn sync_denied(&self) {}
    }

    #[test]
    fn up_pings_are_throttled_errors_are_not() {
        let sink = Arc::new(CountingSink::default());
        let status = ThrottledStatus::with_window(sink.clone(), Duration::from_secs(60));

        status.ping_up();
        status.ping_up();
        status.ping_up();
        assert_eq!(sink.up.load(Ordering::SeqCst), 1);

        status.ping_error();
        status.ping_error();
        assert_eq!(sink.error.load(Ordering::SeqCst), 2);
    }
}
