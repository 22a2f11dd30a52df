//! Directory bootstrap and refresh.
//!
//! `update_directory` makes sure there is a listing for every configured
//! server, refreshes each listing's local projects store from the server's
//! directory, and re-runs the self-healing pass over activated projects.
//! Called on startup and on explicit refresh.

use crate::engine::SyncEngine;
use crate::error::EngineError;
use crate::link_manager;
use crate::registry::{self, CreatedListing, LocalDb, PREFIX_PROJECTS};
use outpost_model::{ChangeKind, Listing, ListingId, ProjectDoc, SyncEvent};
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

impl SyncEngine {
    /// Ensure listings exist for each configured server, refresh their
    /// project directories, then heal every activated project.
    pub async fn update_directory(self: &Arc<Self>) -> Result<(), EngineError> {
        self.bus.emit(SyncEvent::ListingsSyncState { syncing: true });

        let mut listings: Vec<Listing> = self.directory_db.all_as()?;
        if listings.is_empty() {
            for url in self.server_urls.clone() {
                let listing = self.generate_listing(&url).await;
                if let Err(e) = self.directory_db.put_as(listing.id.as_str(), &listing) {
                    self.bus.emit(SyncEvent::DirectoryError {
                        error: e.to_string(),
                    });
                    continue;
                }
                listings.push(listing);
            }
        }

        for listing in &listings {
            if let Err(e) = self.process_listing(listing).await {
                warn!(listing_id = %listing.id, error = %e, "listing refresh failed");
                self.bus.emit(SyncEvent::ListingError {
                    listing_id: listing.id.clone(),
                    error: e.to_string(),
                });
            }
        }

        self.bus.emit(SyncEvent::ListingsSyncState { syncing: false });

        self.ensure_active_projects().await
    }

    /// Build a listing for a configured server URL. A server that cannot be
    /// reached still yields a host-derived stub so the device keeps working
    /// offline.
    async fn generate_listing(&self, url: &str) -> Listing {
        match self.api.fetch_info(url).await {
            Ok(listing) => listing,
            Err(e) => {
                warn!(url, error = %e, "server info fetch failed; using stub listing");
                let host = Url::parse(url)
                    .ok()
                    .and_then(|parsed| parsed.host_str().map(str::to_string))
                    .unwrap_or_else(|| url.to_string());
                Listing {
                    id: ListingId::from(host.clone()),
                    name: host,
                    description: "No Description".to_string(),
                    base_url: Some(url.to_string()),
                    projects_db: None,
                    local_only: false,
                    prefix: String::new(),
                }
            }
        }
    }

    /// Process one listing: bring up its local projects store, announce it,
    /// and refresh the store from the server's project directory.
    ///
    /// The `listing_update` announcement is emitted before the first
    /// suspension point.
    pub(crate) async fn process_listing(
        self: &Arc<Self>,
        listing: &Listing,
    ) -> Result<(), EngineError> {
        let (kind, projects_changed, projects_local) = {
            let mut state = self.state()?;
            let (changed, local) = registry::ensure_local_db(
                &self.pool,
                PREFIX_PROJECTS,
                listing.id.as_str(),
                true,
                &mut state.projects_dbs,
                true,
            )?;
            let previous = state.created_listings.insert(
                listing.id.clone(),
                CreatedListing {
                    listing: listing.clone(),
                    projects: local.clone(),
                },
            );
            let kind = if previous.is_none() {
                ChangeKind::Create
            } else {
                ChangeKind::Update
            };
            (kind, changed, local)
        };

        self.bus.emit(SyncEvent::ListingUpdate {
            kind,
            projects_changed,
            listing_id: listing.id.clone(),
        });
        if projects_changed {
            self.bus.emit(SyncEvent::ProjectsSyncState {
                syncing: true,
                listing_id: listing.id.clone(),
            });
        }
        let settle = |engine: &SyncEngine| {
            if projects_changed {
                engine.bus.emit(SyncEvent::ProjectsSyncState {
                    syncing: false,
                    listing_id: listing.id.clone(),
                });
            }
        };

        if listing.local_only || listing.base_url.is_none() {
            settle(self);
            return Ok(());
        }

        let token = self.auth.token_for_listing(&listing.id)?;
        if token.is_none() {
            debug!(listing_id = %listing.id,
                "no credentials for listing; skipping project directory refresh");
            settle(self);
            return Ok(());
        }

        match self.api.fetch_directory(listing, token.as_deref()).await {
            Ok(projects) => {
                for doc in &projects {
                    upsert_project(&projects_local, doc)?;
                }
                info!(listing_id = %listing.id, count = projects.len(),
                    "refreshed project directory");
                settle(self);
                Ok(())
            }
            Err(e) => {
                settle(self);
                Err(e.into())
            }
        }
    }

    /// Re-resolve a listing from the directory store and re-run its
    /// processing. The hook for device-side changes (a credential change,
    /// a settings edit) that require connections to be rebuilt.
    pub async fn reprocess_listing(self: &Arc<Self>, listing_id: &ListingId) {
        let listing = match self.stored_listing(listing_id) {
            Ok(Some(listing)) => listing,
            // Even a 404 is an error here: an active listing must exist.
            Ok(None) => {
                self.bus.emit(SyncEvent::ListingError {
                    listing_id: listing_id.clone(),
                    error: "listing missing from directory store".to_string(),
                });
                return;
            }
            Err(e) => {
                self.bus.emit(SyncEvent::ListingError {
                    listing_id: listing_id.clone(),
                    error: e.to_string(),
                });
                return;
            }
        };
        if let Err(e) = self.process_listing(&listing).await {
            self.bus.emit(SyncEvent::ListingError {
                listing_id: listing_id.clone(),
                error: e.to_string(),
            });
        }
    }

    /// Swap the bearer token in every data link owned by a listing. The
    /// skip-if-unchanged comparison recreates exactly the connections whose
    /// descriptor actually changed.
    pub fn refresh_data_db_tokens(
        self: &Arc<Self>,
        listing_id: &ListingId,
        new_token: &str,
    ) -> Result<(), EngineError> {
        let records = self.active.list()?;
        let mut refreshed = Vec::new();
        {
            let mut state = self.state()?;
            for record in records {
                if record.listing_id != *listing_id {
                    continue;
                }
                let key = record.id.to_string();
                let Some(entry) = state.data_dbs.get(&key) else {
                    warn!(project_id = %record.id, "no data store for active project");
                    continue;
                };
                let Some(remote) = entry.remote.clone() else {
                    debug!(project_id = %record.id, "data store has no remote; skipping");
                    continue;
                };
                let mut info = remote.info;
                info.jwt_token = Some(new_token.to_string());
                let (changed, entry) = link_manager::ensure_synced_db(
                    &key,
                    Some(info),
                    &mut state.data_dbs,
                    remote.options,
                    &self.api,
                )?;
                if let Some(created) = state.created_projects.get_mut(&record.id) {
                    created.data = entry.clone();
                }
                if !changed {
                    continue;
                }
                if let Some(connection) = entry
                    .remote
                    .as_ref()
                    .and_then(|remote| remote.connection.clone())
                {
                    refreshed.push((record.id.clone(), connection));
                }
            }
        }
        for (project_id, connection) in refreshed {
            self.spawn_connection_monitor(project_id, connection, false);
        }
        info!(listing_id = %listing_id, "refreshed data database tokens");
        Ok(())
    }
}

/// Store a directory row, repairing name/status drift on existing entries.
fn upsert_project(projects_local: &LocalDb, doc: &ProjectDoc) -> Result<(), EngineError> {
    match projects_local.local.get_as::<ProjectDoc>(doc.id.as_str())? {
        Some(existing) => {
            if existing.name != doc.name || existing.status != doc.status {
                let merged = ProjectDoc {
                    name: doc.name.clone(),
                    status: doc.status.clone(),
                    ..existing
                };
                projects_local.local.put_as(doc.id.as_str(), &merged)?;
            }
        }
        None => {
            projects_local.local.put_as(doc.id.as_str(), doc)?;
        }
    }
    Ok(())
}
