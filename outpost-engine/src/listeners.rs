//! Listener subscription protocol.
//!
//! `listen_project` lets a caller follow a project's lifecycle across local
//! store destruction and recreation: the listener is (re)invoked on every
//! `project_update` for the id, returns what to do with its teardown, and
//! the protocol guarantees the teardown runs exactly once per installation
//! no matter how the subscription ends. `listen_project_db` and
//! `listen_data_db` are the change-feed specializations.

use crate::engine::SyncEngine;
use crate::error::EngineError;
use crate::events::SubscriptionId;
use crate::registry::CreatedProject;
use outpost_model::{ChangeKind, FullProjectId, SyncEvent};
use outpost_store::{ChangeEvent, ChangeSubscription};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, warn};

pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Teardown installed by a listener. The flag says whether the teardown
/// runs because the project entry was *replaced* (true) rather than
/// deleted or detached (false).
pub type Teardown = Box<dyn FnMut(bool) -> Result<(), ListenerError> + Send>;

/// What a listener wants done with its teardown after an invocation.
pub enum Listened {
    /// Install a new teardown; the previous one (if any) runs first.
    Replace(Teardown),
    /// Leave the previously installed teardown in place.
    Keep,
    /// Install a do-nothing teardown (the previous one still runs).
    Noop,
}

/// Invoked with the current project entry, an error sink for asynchronous
/// failures, and whether the metadata/data stores were just (re)created.
pub type ProjectListener =
    Box<dyn FnMut(&CreatedProject, &ErrorSink, bool, bool) -> Result<Listened, ListenerError> + Send>;

/// Fires at most once, on the subscription's first error.
pub type ErrorListener = Box<dyn FnOnce(ListenerError) + Send>;

enum Slot {
    /// No listener invocation has installed a teardown yet.
    Initial,
    /// The entry was deleted; it may be recreated later.
    Deleted,
    Active(Teardown),
}

struct ListenState {
    slot: Slot,
    listener: Option<ProjectListener>,
    error_listener: Option<ErrorListener>,
    error_fired: bool,
    detached: bool,
    sub_ids: Option<(SubscriptionId, SubscriptionId)>,
    pending_detach: bool,
}

struct Shared {
    project_id: FullProjectId,
    engine: Weak<SyncEngine>,
    state: Mutex<ListenState>,
}

/// Handle returned by `listen_project`; detaching is idempotent.
pub struct ProjectSubscription {
    shared: Arc<Shared>,
}

impl ProjectSubscription {
    /// Unsubscribe from the bus and run the installed teardown exactly
    /// once. Safe to call any number of times.
    pub fn detach(&self) {
        detach_impl(&self.shared);
    }
}

/// Error sink handed to listeners for reporting asynchronous failures; it
/// routes through the subscription's one-shot error latch so cleanup runs.
pub struct ErrorSink {
    shared: Arc<Shared>,
}

impl ErrorSink {
    pub fn report(&self, error: ListenerError) {
        self_destruct(&self.shared, error, true);
    }
}

/// Route an error to the error listener (first time only) and optionally
/// detach. A second error (typically thrown by the teardown that the first
/// error triggered) is logged, never re-dispatched.
fn self_destruct(shared: &Arc<Shared>, error: ListenerError, detach: bool) {
    let error_listener = {
        let Ok(mut st) = shared.state.lock() else {
            return;
        };
        if st.error_fired {
            error!(project_id = %shared.project_id, error = %error,
                "listener error after the error listener already fired");
            return;
        }
        st.error_fired = true;
        st.error_listener.take()
    };
    if let Some(listener) = error_listener {
        listener(error);
    }
    if detach {
        detach_impl(shared);
    }
}

fn detach_impl(shared: &Arc<Shared>) {
    let (sub_ids, teardown) = {
        let Ok(mut st) = shared.state.lock() else {
            return;
        };
        if st.detached {
            return;
        }
        let Some(sub_ids) = st.sub_ids else {
            // Subscription ids are not registered yet (error during the
            // initial synchronous invocation); finish once they are.
            st.pending_detach = true;
            return;
        };
        st.detached = true;
        let teardown = match std::mem::replace(&mut st.slot, Slot::Deleted) {
            Slot::Active(teardown) => Some(teardown),
            _ => None,
        };
        (sub_ids, teardown)
    };

    if let Some(engine) = shared.engine.upgrade() {
        engine.bus().unsubscribe(sub_ids.0);
        engine.bus().unsubscribe(sub_ids.1);
    }
    if let Some(mut teardown) = teardown {
        if let Err(e) = teardown(false) {
            self_destruct(shared, e, false);
        }
    }
}

/// Run the listener against the current entry and apply its verdict.
fn invoke_listener(
    shared: &Arc<Shared>,
    entry: &CreatedProject,
    meta_changed: bool,
    data_changed: bool,
) {
    let mut listener = {
        let Ok(mut st) = shared.state.lock() else {
            return;
        };
        if st.detached || st.error_fired {
            return;
        }
        match st.listener.take() {
            Some(listener) => listener,
            // A re-entrant invocation is already running; skip.
            None => return,
        }
    };

    let sink = ErrorSink {
        shared: shared.clone(),
    };
    let result = listener(entry, &sink, meta_changed, data_changed);
    if let Ok(mut st) = shared.state.lock() {
        st.listener = Some(listener);
    }

    let returned = match result {
        Ok(returned) => returned,
        Err(e) => {
            self_destruct(shared, e, true);
            return;
        }
    };
    let new_teardown: Teardown = match returned {
        Listened::Keep => return,
        Listened::Replace(teardown) => teardown,
        Listened::Noop => Box::new(|_| Ok(())),
    };

    // The previous teardown runs first (as a replacement), then the new
    // one is installed. If the subscription died meanwhile, the fresh
    // teardown runs immediately so nothing leaks.
    let previous = {
        let Ok(mut st) = shared.state.lock() else {
            return;
        };
        match std::mem::replace(&mut st.slot, Slot::Initial) {
            Slot::Active(teardown) => Some(teardown),
            _ => None,
        }
    };
    if let Some(mut previous) = previous {
        if let Err(e) = previous(true) {
            self_destruct(shared, e, true);
        }
    }
    let leftover = {
        let Ok(mut st) = shared.state.lock() else {
            return;
        };
        if st.detached || st.error_fired {
            Some(new_teardown)
        } else {
            st.slot = Slot::Active(new_teardown);
            None
        }
    };
    if let Some(mut teardown) = leftover {
        if let Err(e) = teardown(false) {
            self_destruct(shared, e, false);
        }
    }
}

impl SyncEngine {
    /// Subscribe to a project's lifecycle.
    ///
    /// Guarantees:
    /// 1. a known project fires the listener once, synchronously, with both
    ///    changed flags set;
    /// 2. later `project_update` events re-invoke it, running the previous
    ///    teardown first only when a new one was returned;
    /// 3. a delete runs the installed teardown and parks the subscription
    ///    until the entity is recreated;
    /// 4. if global settlement arrives and the project was never known, the
    ///    error listener fires exactly once with an unknown-project error;
    /// 5. the returned handle detaches idempotently.
    pub fn listen_project(
        self: &Arc<Self>,
        project_id: FullProjectId,
        listener: ProjectListener,
        error_listener: ErrorListener,
    ) -> ProjectSubscription {
        let shared = Arc::new(Shared {
            project_id: project_id.clone(),
            engine: Arc::downgrade(self),
            state: Mutex::new(ListenState {
                slot: Slot::Initial,
                listener: Some(listener),
                error_listener: Some(error_listener),
                error_fired: false,
                detached: false,
                sub_ids: None,
                pending_detach: false,
            }),
        });

        // The project may already be known, in which case no project_update
        // is coming: fire once, synchronously, with both flags set.
        if let Some(entry) = self.project(&project_id) {
            invoke_listener(&shared, &entry, true, true);
        }

        let update_shared = shared.clone();
        let update_id = self.bus().subscribe(move |event| {
            let SyncEvent::ProjectUpdate {
                kind,
                meta_changed,
                data_changed,
                project_id,
            } = event
            else {
                return Ok(());
            };
            if *project_id != update_shared.project_id {
                return Ok(());
            }
            if *kind == ChangeKind::Delete {
                let previous = {
                    let Ok(mut st) = update_shared.state.lock() else {
                        return Ok(());
                    };
                    std::mem::replace(&mut st.slot, Slot::Deleted)
                };
                match previous {
                    Slot::Active(mut teardown) => {
                        if let Err(e) = teardown(false) {
                            self_destruct(&update_shared, e, true);
                        }
                    }
                    Slot::Initial => {
                        debug!(project_id = %update_shared.project_id,
                            "delete event before any teardown was installed");
                    }
                    Slot::Deleted => {}
                }
            } else {
                let Some(engine) = update_shared.engine.upgrade() else {
                    return Ok(());
                };
                if let Some(entry) = engine.project(&update_shared.project_id) {
                    invoke_listener(&update_shared, &entry, *meta_changed, *data_changed);
                }
            }
            Ok(())
        });

        let state_shared = shared.clone();
        let state_id = self.bus().subscribe(move |event| {
            if !matches!(event, SyncEvent::AllState) {
                return Ok(());
            }
            let Some(engine) = state_shared.engine.upgrade() else {
                return Ok(());
            };
            if !engine.summary().all_projects_settled() {
                return Ok(());
            }
            let verdict = {
                let Ok(st) = state_shared.state.lock() else {
                    return Ok(());
                };
                match st.slot {
                    Slot::Initial => Some(true),
                    Slot::Deleted if !st.detached => Some(false),
                    _ => None,
                }
            };
            match verdict {
                Some(true) => {
                    // Everything settled and this project never appeared.
                    self_destruct(
                        &state_shared,
                        Box::new(EngineError::UnknownProject(
                            state_shared.project_id.clone(),
                        )),
                        true,
                    );
                }
                Some(false) => {
                    warn!(project_id = %state_shared.project_id,
                        "project was deleted but the subscription was never detached");
                    // Leave it attached: the entity may be recreated.
                }
                None => {}
            }
            Ok(())
        });

        {
            if let Ok(mut st) = shared.state.lock() {
                st.sub_ids = Some((update_id, state_id));
                if st.pending_detach {
                    drop(st);
                    detach_impl(&shared);
                }
            }
        }
        ProjectSubscription { shared }
    }

    /// Follow a project's metadata change feed across store recreation.
    /// The feed subscription is (re)attached only when the metadata store
    /// was just (re)created; its cancel is the installed teardown.
    pub fn listen_project_db(
        self: &Arc<Self>,
        project_id: FullProjectId,
        change_listener: impl FnMut(ChangeEvent) + Send + 'static,
        error_listener: ErrorListener,
    ) -> ProjectSubscription {
        self.listen_changes(project_id, change_listener, error_listener, false)
    }

    /// Follow a project's data change feed across store recreation.
    pub fn listen_data_db(
        self: &Arc<Self>,
        project_id: FullProjectId,
        change_listener: impl FnMut(ChangeEvent) + Send + 'static,
        error_listener: ErrorListener,
    ) -> ProjectSubscription {
        self.listen_changes(project_id, change_listener, error_listener, true)
    }

    fn listen_changes(
        self: &Arc<Self>,
        project_id: FullProjectId,
        change_listener: impl FnMut(ChangeEvent) + Send + 'static,
        error_listener: ErrorListener,
        data: bool,
    ) -> ProjectSubscription {
        let change_listener = Arc::new(Mutex::new(change_listener));
        self.listen_project(
            project_id,
            Box::new(move |project, _sink, meta_changed, data_changed| {
                let changed = if data { data_changed } else { meta_changed };
                if !changed {
                    return Ok(Listened::Keep);
                }
                let feed = if data {
                    &project.data.changes
                } else {
                    &project.meta.changes
                };
                let change_listener = change_listener.clone();
                let subscription = ChangeSubscription::spawn(feed, move |event| {
                    if let Ok(mut listener) = change_listener.lock() {
                        listener(event);
                    }
                });
                Ok(Listened::Replace(Box::new(move |_replaced| {
                    subscription.cancel();
                    Ok(())
                })))
            }),
            error_listener,
        )
    }

    /// Re-notify on every update of a project's entry, without ever
    /// installing a real teardown.
    pub fn listen_project_info(
        self: &Arc<Self>,
        project_id: FullProjectId,
        mut listener: impl FnMut(&CreatedProject) + Send + 'static,
        error_listener: ErrorListener,
    ) -> ProjectSubscription {
        self.listen_project(
            project_id,
            Box::new(move |project, _sink, _meta_changed, _data_changed| {
                listener(project);
                Ok(Listened::Noop)
            }),
            error_listener,
        )
    }
}
