//! Sync-state aggregation.
//!
//! [`SyncStateSummary`] folds the event stream into per-listing and
//! per-project settlement maps and four aggregate flags. Recomputation is a
//! pure function of the maps: no event is replayed, and an error event can
//! only upgrade an id to settled, never downgrade one. After every relevant
//! event the aggregator re-emits `all_state` unconditionally so pollers can
//! rely on it as a wake-up signal.

use crate::engine::SyncEngine;
use crate::events::{EventBus, SubscriptionId};
use async_trait::async_trait;
use outpost_model::{ChangeKind, FullProjectId, ListingId, SyncEvent};
use outpost_store::ChangeSubscription;
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tracing::error;

#[derive(Default)]
struct SummaryInner {
    listings_settled: bool,
    all_projects_settled: bool,
    all_meta_settled: bool,
    all_data_settled: bool,
    listing_projects: HashMap<ListingId, bool>,
    projects_meta: HashMap<FullProjectId, bool>,
    projects_data: HashMap<FullProjectId, bool>,
}

impl SummaryInner {
    fn recompute(&mut self) {
        self.all_projects_settled =
            self.listings_settled && self.listing_projects.values().all(|settled| *settled);
        self.all_meta_settled =
            self.all_projects_settled && self.projects_meta.values().all(|settled| *settled);
        self.all_data_settled =
            self.all_projects_settled && self.projects_data.values().all(|settled| *settled);
    }
}

/// Aggregated settlement flags, shared by reference across the engine.
#[derive(Default)]
pub struct SyncStateSummary {
    inner: Mutex<SummaryInner>,
}

impl SyncStateSummary {
    /// The directory refresh pass has completed.
    pub fn listings_settled(&self) -> bool {
        self.read(|inner| inner.listings_settled)
    }

    /// Listings are settled and every known listing's projects store is.
    pub fn all_projects_settled(&self) -> bool {
        self.read(|inner| inner.all_projects_settled)
    }

    pub fn all_meta_settled(&self) -> bool {
        self.read(|inner| inner.all_meta_settled)
    }

    pub fn all_data_settled(&self) -> bool {
        self.read(|inner| inner.all_data_settled)
    }

    pub fn listing_settled(&self, listing_id: &ListingId) -> Option<bool> {
        self.read(|inner| inner.listing_projects.get(listing_id).copied())
    }

    pub fn project_meta_settled(&self, project_id: &FullProjectId) -> Option<bool> {
        self.read(|inner| inner.projects_meta.get(project_id).copied())
    }

    pub fn project_data_settled(&self, project_id: &FullProjectId) -> Option<bool> {
        self.read(|inner| inner.projects_data.get(project_id).copied())
    }

    fn read<T>(&self, f: impl FnOnce(&SummaryInner) -> T) -> T
    where
        T: Default,
    {
        match self.inner.lock() {
            Ok(inner) => f(&inner),
            Err(_) => T::default(),
        }
    }

    /// Fold one event into the maps. Returns whether the event was relevant
    /// (and an `all_state` re-emission is due).
    fn apply(&self, event: &SyncEvent) -> bool {
        let Ok(mut inner) = self.inner.lock() else {
            return false;
        };
        let relevant = match event {
            SyncEvent::ListingsSyncState { syncing } => {
                inner.listings_settled = !syncing;
                true
            }
            SyncEvent::ListingUpdate {
                kind: ChangeKind::Delete,
                listing_id,
                ..
            } => {
                inner.listing_projects.remove(listing_id);
                true
            }
            SyncEvent::ListingUpdate {
                projects_changed,
                listing_id,
                ..
            } => {
                // A listing whose projects store did not change has nothing
                // to wait for; keep an existing verdict either way.
                let settled = !projects_changed;
                inner
                    .listing_projects
                    .entry(listing_id.clone())
                    .or_insert(settled);
                true
            }
            SyncEvent::ProjectsSyncState {
                syncing,
                listing_id,
            } => {
                inner.listing_projects.insert(listing_id.clone(), !syncing);
                true
            }
            SyncEvent::ListingError { listing_id, .. } => {
                // Errors settle: nothing should wait on a failed listing.
                inner.listing_projects.insert(listing_id.clone(), true);
                true
            }
            SyncEvent::ProjectUpdate {
                kind: ChangeKind::Delete,
                project_id,
                ..
            } => {
                inner.projects_meta.remove(project_id);
                inner.projects_data.remove(project_id);
                true
            }
            SyncEvent::ProjectUpdate { project_id, .. } => {
                inner.projects_meta.insert(project_id.clone(), false);
                inner.projects_data.insert(project_id.clone(), false);
                true
            }
            SyncEvent::ProjectError { project_id, .. } => {
                inner.projects_meta.insert(project_id.clone(), true);
                inner.projects_data.insert(project_id.clone(), true);
                true
            }
            SyncEvent::MetaSyncState {
                syncing,
                project_id,
            } => {
                inner.projects_meta.insert(project_id.clone(), !syncing);
                true
            }
            SyncEvent::DataSyncState {
                syncing,
                project_id,
            } => {
                inner.projects_data.insert(project_id.clone(), !syncing);
                true
            }
            SyncEvent::AllState | SyncEvent::DirectoryError { .. } => false,
        };
        if relevant {
            inner.recompute();
        }
        relevant
    }
}

/// Wire the aggregator into the bus. Every relevant event updates the
/// summary and re-emits `all_state`.
pub fn register_sync_state(bus: &EventBus, summary: Arc<SyncStateSummary>) -> SubscriptionId {
    let bus_out = bus.clone();
    bus.subscribe(move |event| {
        if summary.apply(event) {
            bus_out.emit(SyncEvent::AllState);
        }
        Ok(())
    })
}

/// Application-level conflict resolution, invoked per observed document
/// change once a data store has settled. The merge algorithm itself is a
/// collaborator.
#[async_trait]
pub trait ConflictResolver: Send + Sync {
    async fn merge_heads(
        &self,
        project_id: &FullProjectId,
        doc_id: &str,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// A data document participates in merging when it carries the record
/// format marker.
pub(crate) fn is_record(doc: &Json) -> bool {
    doc.get("record_format_version").is_some()
}

/// Subscribe the resolver to data-store settlement: each settled data store
/// gets a change-feed listener that merges every subsequently observed
/// record change.
pub fn register_automerge_resolver(
    engine: &Arc<SyncEngine>,
    resolver: Arc<dyn ConflictResolver>,
) -> SubscriptionId {
    let weak: Weak<SyncEngine> = Arc::downgrade(engine);
    engine.bus().subscribe(move |event| {
        let SyncEvent::DataSyncState {
            syncing: false,
            project_id,
        } = event
        else {
            return Ok(());
        };
        let Some(engine) = weak.upgrade() else {
            return Ok(());
        };
        let Some(entry) = engine.project(project_id) else {
            return Ok(());
        };

        let resolver = resolver.clone();
        let project_id = project_id.clone();
        let subscription = ChangeSubscription::spawn(&entry.data.changes, move |change| {
            if change.deleted {
                return;
            }
            let Some(doc) = &change.doc else {
                return;
            };
            if !is_record(doc) {
                return;
            }
            let resolver = resolver.clone();
            let project_id = project_id.clone();
            let doc_id = change.id.clone();
            tokio::spawn(async move {
                if let Err(e) = resolver.merge_heads(&project_id, &doc_id).await {
                    error!(project_id = %project_id, doc_id = %doc_id, error = %e,
                        "automerge failed");
                }
            });
        });
        engine.track_hook_subscription(subscription);
        Ok(())
    })
}
