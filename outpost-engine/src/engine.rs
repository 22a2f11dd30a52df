//! The sync engine aggregate.
//!
//! All registries are owned, injected state on one [`SyncEngine`] value
//! rather than module-level singletons, so the engine can be instantiated
//! many times side by side (every test builds its own). Construction goes
//! through [`SyncEngineBuilder`].

use crate::error::EngineError;
use crate::events::EventBus;
use crate::registry::{CreatedListing, CreatedProject, DbTable, LocalDb};
use crate::sync_state::{register_sync_state, SyncStateSummary};
use outpost_model::{FullProjectId, Listing, ListingId};
use outpost_replication::{
    HttpServerApi, NullStatusSink, ServerApi, SyncStatusSink, ThrottledStatus,
};
use outpost_store::{
    ActiveStore, AuthStore, ChangeSubscription, DataDir, DocStore, StorePool,
};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{info, warn};

pub(crate) struct EngineState {
    pub projects_dbs: DbTable,
    pub metadata_dbs: DbTable,
    pub data_dbs: DbTable,
    pub created_listings: HashMap<ListingId, CreatedListing>,
    pub created_projects: HashMap<FullProjectId, CreatedProject>,
}

pub struct SyncEngineBuilder {
    data_dir: DataDir,
    server_urls: Vec<String>,
    api: Option<Arc<dyn ServerApi>>,
    status_sink: Option<Arc<dyn SyncStatusSink>>,
}

impl SyncEngineBuilder {
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            server_urls: Vec::new(),
            api: None,
            status_sink: None,
        }
    }

    /// Add a configured server URL for the directory bootstrap.
    pub fn with_server_url(mut self, url: impl Into<String>) -> Self {
        self.server_urls.push(url.into());
        self
    }

    /// Inject a server API implementation (tests use in-memory ones).
    pub fn with_api(mut self, api: Arc<dyn ServerApi>) -> Self {
        self.api = Some(api);
        self
    }

    /// Attach the UI's sync-activity indicator.
    pub fn with_status_sink(mut self, sink: Arc<dyn SyncStatusSink>) -> Self {
        self.status_sink = Some(sink);
        self
    }

    pub fn build(self) -> Result<Arc<SyncEngine>, EngineError> {
        self.data_dir.ensure_dirs().map_err(outpost_store::StoreError::from)?;

        let status = Arc::new(ThrottledStatus::new(
            self.status_sink.unwrap_or_else(|| Arc::new(NullStatusSink)),
        ));
        let api = self
            .api
            .unwrap_or_else(|| Arc::new(HttpServerApi::new(status.clone())));

        let directory_db = Arc::new(DocStore::open(
            self.data_dir.directory_db(),
            crate::registry::PREFIX_DIRECTORY,
        )?);
        let active = ActiveStore::new(Arc::new(DocStore::open(
            self.data_dir.active_db(),
            crate::registry::PREFIX_ACTIVE,
        )?));
        let auth = AuthStore::new(Arc::new(DocStore::open(
            self.data_dir.auth_db(),
            crate::registry::PREFIX_LOCAL_AUTH,
        )?));
        let local_state = Arc::new(DocStore::open(
            self.data_dir.local_state_db(),
            crate::registry::PREFIX_LOCAL_STATE,
        )?);

        let pool = Arc::new(StorePool::new(self.data_dir.clone()));
        let bus = EventBus::new();
        let summary = Arc::new(SyncStateSummary::default());
        register_sync_state(&bus, summary.clone());

        let engine = Arc::new(SyncEngine {
            data_dir: self.data_dir,
            server_urls: self.server_urls,
            pool,
            bus,
            api,
            status,
            directory_db,
            active,
            auth,
            local_state,
            summary,
            state: Mutex::new(EngineState {
                projects_dbs: DbTable::new(),
                metadata_dbs: DbTable::new(),
                data_dbs: DbTable::new(),
                created_listings: HashMap::new(),
                created_projects: HashMap::new(),
            }),
            hook_subscriptions: Mutex::new(Vec::new()),
        });
        info!(data_dir = %engine.data_dir.base().display(), "sync engine ready");
        Ok(engine)
    }
}

/// The hierarchical replication and sync-state engine.
pub struct SyncEngine {
    pub(crate) data_dir: DataDir,
    pub(crate) server_urls: Vec<String>,
    pub(crate) pool: Arc<StorePool>,
    pub(crate) bus: EventBus,
    pub(crate) api: Arc<dyn ServerApi>,
    pub(crate) status: Arc<ThrottledStatus>,
    pub(crate) directory_db: Arc<DocStore>,
    pub(crate) active: ActiveStore,
    pub(crate) auth: AuthStore,
    pub(crate) local_state: Arc<DocStore>,
    pub(crate) summary: Arc<SyncStateSummary>,
    pub(crate) state: Mutex<EngineState>,
    /// Change-feed subscriptions installed by the automerge hook; kept
    /// alive here, released on shutdown.
    hook_subscriptions: Mutex<Vec<ChangeSubscription>>,
}

impl SyncEngine {
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn summary(&self) -> &Arc<SyncStateSummary> {
        &self.summary
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    pub fn directory_db(&self) -> &Arc<DocStore> {
        &self.directory_db
    }

    pub fn active(&self) -> &ActiveStore {
        &self.active
    }

    pub fn auth(&self) -> &AuthStore {
        &self.auth
    }

    /// App state kept across sessions; the engine stores nothing here.
    pub fn local_state(&self) -> &Arc<DocStore> {
        &self.local_state
    }

    pub(crate) fn state(&self) -> Result<MutexGuard<'_, EngineState>, EngineError> {
        self.state.lock().map_err(|_| EngineError::LockPoisoned)
    }

    /// The in-memory join for a listing, if it has been processed.
    pub fn listing(&self, listing_id: &ListingId) -> Option<CreatedListing> {
        self.state.lock().ok()?.created_listings.get(listing_id).cloned()
    }

    pub fn all_listing_ids(&self) -> Vec<ListingId> {
        self.state
            .lock()
            .map(|state| state.created_listings.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// The in-memory join for a project, if it is activated with live
    /// stores.
    pub fn project(&self, project_id: &FullProjectId) -> Option<CreatedProject> {
        self.state.lock().ok()?.created_projects.get(project_id).cloned()
    }

    pub fn project_is_activated(&self, project_id: &FullProjectId) -> bool {
        self.project(project_id).is_some()
    }

    /// Current data store registry entry for a project.
    pub fn data_db(&self, project_id: &FullProjectId) -> Option<LocalDb> {
        self.state.lock().ok()?.data_dbs.get(project_id.as_str()).cloned()
    }

    /// Current metadata store registry entry for a project.
    pub fn metadata_db(&self, project_id: &FullProjectId) -> Option<LocalDb> {
        self.state
            .lock()
            .ok()?
            .metadata_dbs
            .get(project_id.as_str())
            .cloned()
    }

    /// Current projects store registry entry for a listing.
    pub fn projects_db(&self, listing_id: &ListingId) -> Option<LocalDb> {
        self.state
            .lock()
            .ok()?
            .projects_dbs
            .get(listing_id.as_str())
            .cloned()
    }

    /// Stored listing record, straight from the directory store.
    pub fn stored_listing(&self, listing_id: &ListingId) -> Result<Option<Listing>, EngineError> {
        Ok(self.directory_db.get_as(listing_id.as_str())?)
    }

    pub(crate) fn track_hook_subscription(&self, subscription: ChangeSubscription) {
        if let Ok(mut subscriptions) = self.hook_subscriptions.lock() {
            subscriptions.push(subscription);
        }
    }

    /// Cancel every replication connection and hook subscription. Local
    /// stores stay intact.
    pub fn shutdown(&self) {
        if let Ok(mut state) = self.state.lock() {
            let cancel_table = |table: &mut DbTable| {
                for entry in table.values_mut() {
                    if let Some(remote) = entry.remote.as_mut() {
                        if let Some(connection) = remote.connection.take() {
                            connection.cancel();
                        }
                    }
                }
            };
            cancel_table(&mut state.projects_dbs);
            cancel_table(&mut state.metadata_dbs);
            cancel_table(&mut state.data_dbs);
        }
        if let Ok(mut subscriptions) = self.hook_subscriptions.lock() {
            for subscription in subscriptions.drain(..) {
                subscription.cancel();
            }
        }
        info!("sync engine shutdown complete");
    }

    /// Destroy every managed store: synced tables first, then the
    /// local-only stores. Used on logout/reset; the caller is expected to
    /// reinitialize from scratch afterwards.
    pub fn wipe_local_databases(&self) -> Result<(), EngineError> {
        self.shutdown();
        {
            let mut state = self.state()?;
            state.projects_dbs.clear();
            state.metadata_dbs.clear();
            state.data_dbs.clear();
            state.created_listings.clear();
            state.created_projects.clear();
        }
        self.pool.destroy_all();
        for store in [
            &self.directory_db,
            self.active.store(),
            self.auth.store(),
            &self.local_state,
        ] {
            if let Err(e) = store.destroy() {
                warn!(store = %store.name(), error = %e, "failed to destroy store");
            }
        }
        info!("wiped local databases");
        Ok(())
    }
}
