//! Project lifecycle management.
//!
//! Activation persists the device-local decision, brings up the local
//! stores, and establishes the data replication link. Every step is
//! idempotent so `ensure_active_projects` can re-run the whole set at any
//! time to self-heal (the startup path, and the recovery path for orphaned
//! active records).

use crate::engine::SyncEngine;
use crate::error::EngineError;
use crate::link_manager;
use crate::registry::{self, CreatedProject, LocalDb, PREFIX_DATA, PREFIX_METADATA};
use outpost_model::{
    ActiveProjectRecord, ChangeKind, ConnectionInfo, FullProjectId, ListingId, ProjectDoc,
    ProjectId, ReplicateOptions, SyncEvent,
};
use outpost_replication::{ReplicationEvent, ReplicationHandle};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Document id the fetched metadata bundle is stored under in a project's
/// metadata store.
pub const UI_SPECIFICATION_ID: &str = "ui-specification";

impl SyncEngine {
    /// Activate a project on this device.
    ///
    /// Idempotent: re-activating an already-active project returns its id
    /// untouched. Fails loudly when the project cannot be resolved from the
    /// listing's local projects store after the active record was written;
    /// the orphaned record is recovered by a later
    /// [`ensure_active_projects`](Self::ensure_active_projects) pass.
    pub async fn activate_project(
        self: &Arc<Self>,
        listing_id: &ListingId,
        project_id: &ProjectId,
        is_sync: bool,
    ) -> Result<FullProjectId, EngineError> {
        if project_id.as_str().starts_with("_design/") || project_id.as_str().starts_with('_') {
            return Err(EngineError::ReservedProjectId(project_id.to_string()));
        }

        let full_id = FullProjectId::resolve(listing_id, project_id);
        if self.active.get(&full_id)?.is_some() {
            debug!(project_id = %full_id, "project already active");
            return Ok(full_id);
        }

        let record = ActiveProjectRecord {
            id: full_id.clone(),
            listing_id: listing_id.clone(),
            project_id: project_id.clone(),
            is_sync,
            is_sync_attachments: false,
            friendly_name: None,
            username: None,
        };
        self.active.put(&record)?;

        let project = self
            .project_from_directory(listing_id, project_id)?
            .ok_or_else(|| EngineError::UnknownProject(full_id.clone()))?;
        self.ensure_project_databases(&record, &project).await?;

        info!(project_id = %full_id, "activated project");
        Ok(full_id)
    }

    /// Resolve a project record from the listing's local projects store.
    pub fn project_from_directory(
        &self,
        listing_id: &ListingId,
        project_id: &ProjectId,
    ) -> Result<Option<ProjectDoc>, EngineError> {
        let projects = {
            let state = self.state()?;
            match state.projects_dbs.get(listing_id.as_str()) {
                Some(entry) => entry.local.clone(),
                None => return Ok(None),
            }
        };
        Ok(projects.get_as(project_id.as_str())?)
    }

    /// Create or refresh a project's local stores and its replication link.
    ///
    /// The local bring-up, the `project_update` announcement, and the
    /// conditional `*_sync_state(true)` markers form one unbroken
    /// synchronous segment; the metadata fetch is the first suspension
    /// point. A consumer that attaches a change-feed listener inside its
    /// `project_update` handler therefore cannot miss an event.
    pub async fn ensure_project_databases(
        self: &Arc<Self>,
        active: &ActiveProjectRecord,
        project: &ProjectDoc,
    ) -> Result<(), EngineError> {
        let project_id = active.id.clone();
        let key = project_id.to_string();

        let (kind, meta_changed, data_changed, meta_local) = {
            let mut state = self.state()?;
            let (meta_changed, meta_local) = registry::ensure_local_db(
                &self.pool,
                PREFIX_METADATA,
                &key,
                active.is_sync,
                &mut state.metadata_dbs,
                true,
            )?;
            let (data_changed, data_local) = registry::ensure_local_db(
                &self.pool,
                PREFIX_DATA,
                &key,
                active.is_sync,
                &mut state.data_dbs,
                active.is_sync_attachments,
            )?;
            let previous = state.created_projects.insert(
                project_id.clone(),
                CreatedProject {
                    project: project.clone(),
                    active: active.clone(),
                    meta: meta_local.clone(),
                    data: data_local,
                },
            );
            let kind = if previous.is_none() {
                ChangeKind::Create
            } else {
                ChangeKind::Update
            };
            (kind, meta_changed, data_changed, meta_local)
        };

        self.bus.emit(SyncEvent::ProjectUpdate {
            kind,
            meta_changed,
            data_changed,
            project_id: project_id.clone(),
        });
        if meta_changed {
            self.bus.emit(SyncEvent::MetaSyncState {
                syncing: true,
                project_id: project_id.clone(),
            });
        }
        if data_changed {
            self.bus.emit(SyncEvent::DataSyncState {
                syncing: true,
                project_id: project_id.clone(),
            });
        }

        let listing = self
            .listing(&active.listing_id)
            .map(|created| created.listing)
            .ok_or_else(|| EngineError::UnknownListing(active.listing_id.clone()))?;
        let token = self.auth.token_for_listing(&active.listing_id)?;

        // The metadata bundle comes from the server API, not replication.
        match self
            .api
            .fetch_project_metadata(&listing, &active.project_id, token.as_deref())
            .await
        {
            Ok(bundle) => {
                meta_local.local.put(UI_SPECIFICATION_ID, &bundle)?;
                if meta_changed {
                    self.bus.emit(SyncEvent::MetaSyncState {
                        syncing: false,
                        project_id: project_id.clone(),
                    });
                }
            }
            Err(e) => {
                warn!(project_id = %project_id, error = %e, "project metadata fetch failed");
                if meta_changed {
                    self.bus.emit(SyncEvent::MetaSyncState {
                        syncing: false,
                        project_id: project_id.clone(),
                    });
                }
                return Err(e.into());
            }
        }

        // Data store replication link: push+pull, live, retrying.
        let connection_info = if listing.local_only {
            None
        } else {
            Some(self.data_connection_info(&listing.base_url, project, token)?)
        };
        let entry = {
            let mut state = self.state()?;
            // Re-check after the suspension: a concurrent deactivation may
            // have removed the entry while the metadata fetch was in flight.
            if !state.data_dbs.contains_key(&key) {
                debug!(project_id = %project_id,
                    "data store disappeared during bring-up; project was deactivated");
                return Ok(());
            }
            let (_, entry) = link_manager::ensure_synced_db(
                &key,
                connection_info,
                &mut state.data_dbs,
                ReplicateOptions::two_way(),
                &self.api,
            )?;
            if let Some(created) = state.created_projects.get_mut(&project_id) {
                created.data = entry.clone();
            }
            entry
        };

        match connection_of(&entry) {
            Some(connection) => {
                self.spawn_connection_monitor(project_id, connection, data_changed);
            }
            None => {
                // Local-only or sync disabled: close the pair immediately so
                // nothing waits on a link that will never pause.
                if data_changed {
                    self.bus.emit(SyncEvent::DataSyncState {
                        syncing: false,
                        project_id,
                    });
                }
            }
        }
        Ok(())
    }

    /// Derive the data store connection descriptor, falling back to the
    /// deterministic `data-{project_id}` database name when the server's
    /// project record omits one.
    fn data_connection_info(
        &self,
        listing_base_url: &Option<String>,
        project: &ProjectDoc,
        token: Option<String>,
    ) -> Result<ConnectionInfo, EngineError> {
        let db_name = project
            .data_db
            .as_ref()
            .and_then(|overlay| overlay.db_name.clone())
            .unwrap_or_else(|| format!("data-{}", project.id));
        let mut info = ConnectionInfo {
            db_name,
            jwt_token: token,
            ..ConnectionInfo::default()
        };
        if let Some(overlay) = &project.data_db {
            info = info.overlay(overlay);
        }
        if info.base_url.is_none() {
            info.base_url = listing_base_url.clone();
        }
        if info.base_url.is_none() {
            return Err(EngineError::MisconfiguredConnection(info.db_name));
        }
        Ok(info)
    }

    /// Re-run the project bring-up for every persisted active record. Safe
    /// to call at any time; every step it takes is idempotent.
    pub async fn ensure_active_projects(self: &Arc<Self>) -> Result<(), EngineError> {
        for record in self.active.list()? {
            let project = match self.project_from_directory(&record.listing_id, &record.project_id)
            {
                Ok(Some(project)) => project,
                Ok(None) => {
                    warn!(project_id = %record.id,
                        "active project missing from its listing's projects store");
                    self.bus.emit(SyncEvent::ProjectError {
                        project_id: record.id.clone(),
                        error: EngineError::UnknownProject(record.id.clone()).to_string(),
                    });
                    continue;
                }
                Err(e) => {
                    self.bus.emit(SyncEvent::ProjectError {
                        project_id: record.id.clone(),
                        error: e.to_string(),
                    });
                    continue;
                }
            };
            if let Err(e) = self.ensure_project_databases(&record, &project).await {
                warn!(project_id = %record.id, error = %e, "project bring-up failed");
                self.bus.emit(SyncEvent::ProjectError {
                    project_id: record.id.clone(),
                    error: e.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Deactivate a project: cancel its connections, drop its registry
    /// entries, and announce the deletion, all before the persisted record
    /// removal, so no concurrent caller can observe a half-torn-down entry.
    pub fn deactivate_project(&self, project_id: &FullProjectId) -> Result<(), EngineError> {
        let key = project_id.to_string();
        {
            let mut state = self.state()?;
            if let Some(entry) = state.metadata_dbs.remove(&key) {
                cancel_connection(&entry);
            }
            if let Some(entry) = state.data_dbs.remove(&key) {
                cancel_connection(&entry);
            }
            state.created_projects.remove(project_id);
        }
        self.bus.emit(SyncEvent::ProjectUpdate {
            kind: ChangeKind::Delete,
            meta_changed: false,
            data_changed: false,
            project_id: project_id.clone(),
        });
        self.active.remove(project_id)?;
        info!(project_id = %project_id, "deactivated project");
        Ok(())
    }

    /// Drop a listing from memory: cancel its projects-store connection and
    /// announce the deletion. Activated projects keep their own records.
    pub fn delete_listing(&self, listing_id: &ListingId) -> Result<(), EngineError> {
        {
            let mut state = self.state()?;
            if let Some(entry) = state.projects_dbs.remove(listing_id.as_str()) {
                cancel_connection(&entry);
            }
            state.created_listings.remove(listing_id);
        }
        self.bus.emit(SyncEvent::ListingUpdate {
            kind: ChangeKind::Delete,
            projects_changed: false,
            listing_id: listing_id.clone(),
        });
        info!(listing_id = %listing_id, "deleted listing");
        Ok(())
    }

    /// Forward a connection's replication events into activity pings, and
    /// emit the paired `data_sync_state(false)` once the initial pass
    /// pauses (when this monitor owns that pair).
    pub(crate) fn spawn_connection_monitor(
        self: &Arc<Self>,
        project_id: FullProjectId,
        connection: ReplicationHandle,
        emit_pause: bool,
    ) {
        let bus = self.bus.clone();
        let status = self.status.clone();
        let mut rx = connection.subscribe();
        // The link may have settled before this subscription existed; the
        // latch on the handle closes that gap.
        let mut pause_pending = emit_pause;
        if pause_pending && connection.is_settled() {
            pause_pending = false;
            bus.emit(SyncEvent::DataSyncState {
                syncing: false,
                project_id: project_id.clone(),
            });
        }
        drop(connection);
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(ReplicationEvent::Paused) => {
                        if pause_pending {
                            pause_pending = false;
                            bus.emit(SyncEvent::DataSyncState {
                                syncing: false,
                                project_id: project_id.clone(),
                            });
                        }
                    }
                    Ok(ReplicationEvent::Active) => {
                        debug!(project_id = %project_id, "data sync active");
                        status.ping_down();
                        status.ping_up();
                    }
                    Ok(ReplicationEvent::Denied(reason)) => {
                        debug!(project_id = %project_id, reason = %reason, "data sync denied");
                        status.ping_denied();
                    }
                    Ok(ReplicationEvent::Error {
                        message,
                        unauthorized,
                    }) => {
                        if unauthorized {
                            debug!(project_id = %project_id, "data sync waiting on credentials");
                        } else {
                            debug!(project_id = %project_id, message = %message, "data sync error");
                            status.ping_error();
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => {
                        // The link died before its first pause (cancelled
                        // mid-pass); close the pair so state can settle.
                        if pause_pending {
                            bus.emit(SyncEvent::DataSyncState {
                                syncing: false,
                                project_id: project_id.clone(),
                            });
                        }
                        break;
                    }
                }
            }
        });
    }
}

fn cancel_connection(entry: &LocalDb) {
    if let Some(remote) = &entry.remote {
        if let Some(connection) = &remote.connection {
            connection.cancel();
        }
    }
}

fn connection_of(entry: &LocalDb) -> Option<ReplicationHandle> {
    entry
        .remote
        .as_ref()
        .and_then(|remote| remote.connection.clone())
}
