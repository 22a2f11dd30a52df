//! Per-project sync toggles.
//!
//! The user-facing on/off switch for a project's data replication and the
//! separate switch for attachment download. Both persist the desired state
//! to the active store first, then reconcile the running connection.

use crate::engine::SyncEngine;
use crate::error::EngineError;
use crate::link_manager;
use outpost_model::FullProjectId;
use std::sync::Arc;
use tracing::info;

impl SyncEngine {
    /// Turn a project's data replication on or off.
    ///
    /// Off cancels the running connection immediately (in-flight requests
    /// may complete; their results are discarded) and clears the handle.
    /// On always starts a fresh connection, never resumes the old one.
    pub fn set_syncing_project(
        self: &Arc<Self>,
        project_id: &FullProjectId,
        is_sync: bool,
    ) -> Result<(), EngineError> {
        let record = self.active.set_sync(project_id, is_sync)?;
        let key = project_id.to_string();

        let new_connection = {
            let mut state = self.state()?;
            if let Some(entry) = state.metadata_dbs.get_mut(&key) {
                entry.is_sync = is_sync;
            }
            let mut data_snapshot = None;
            let mut new_connection = None;
            if let Some(entry) = state.data_dbs.get_mut(&key) {
                entry.is_sync = is_sync;
                link_manager::reconcile_connection(entry);
                new_connection = entry
                    .remote
                    .as_ref()
                    .and_then(|remote| remote.connection.clone());
                data_snapshot = Some(entry.clone());
            }
            if let Some(created) = state.created_projects.get_mut(project_id) {
                created.active = record;
                created.meta.is_sync = is_sync;
                if let Some(snapshot) = data_snapshot {
                    created.data = snapshot;
                }
            }
            new_connection
        };

        if let Some(connection) = new_connection {
            self.spawn_connection_monitor(project_id.clone(), connection, false);
        }
        info!(project_id = %project_id, is_sync, "set project sync");
        Ok(())
    }

    /// Turn attachment download on or off for a project's data store. The
    /// pull filter is part of the running connection, so an active link is
    /// cancelled and recreated with the new filter.
    pub fn set_syncing_attachments(
        self: &Arc<Self>,
        project_id: &FullProjectId,
        is_sync_attachments: bool,
    ) -> Result<(), EngineError> {
        let record = self
            .active
            .set_sync_attachments(project_id, is_sync_attachments)?;
        let key = project_id.to_string();

        let new_connection = {
            let mut state = self.state()?;
            let mut data_snapshot = None;
            let mut new_connection = None;
            if let Some(entry) = state.data_dbs.get_mut(&key) {
                entry.is_sync_attachments = is_sync_attachments;
                link_manager::reconcile_connection(entry);
                new_connection = entry
                    .remote
                    .as_ref()
                    .and_then(|remote| remote.connection.clone());
                data_snapshot = Some(entry.clone());
            }
            if let Some(created) = state.created_projects.get_mut(project_id) {
                created.active = record;
                if let Some(snapshot) = data_snapshot {
                    created.data = snapshot;
                }
            }
            new_connection
        };

        if let Some(connection) = new_connection {
            self.spawn_connection_monitor(project_id.clone(), connection, false);
        }
        info!(project_id = %project_id, is_sync_attachments, "set attachment sync");
        Ok(())
    }

    /// The persisted sync flag, `None` when the project is not active.
    pub fn is_syncing_project(
        &self,
        project_id: &FullProjectId,
    ) -> Result<Option<bool>, EngineError> {
        Ok(self
            .active()
            .get(project_id)?
            .map(|record| record.is_sync))
    }
}
