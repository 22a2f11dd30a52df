//! Replication link management.
//!
//! `ensure_synced_db` reconciles a registry entry's remote link with a
//! requested configuration; `reconcile_connection` reconciles the running
//! connection with the entry's `is_sync` flag. Neither ever touches the
//! local store, and connection failures only ever surface as replication
//! events.

use crate::error::EngineError;
use crate::registry::{DbTable, LocalDb, RemoteLink};
use outpost_model::{ConnectionInfo, ReplicateOptions};
use outpost_replication::{replicate, ServerApi};
use std::sync::Arc;
use tracing::{debug, info};

/// Configure (or reconfigure) the remote link for an existing local entry.
///
/// Preconditions: `ensure_local_db` must already have created the entry;
/// anything else is a programmer error and fails loudly. A request that is
/// structurally equal to the applied configuration returns the entry
/// unchanged, running connection included. A `None` connection info marks
/// the entry local-only.
pub fn ensure_synced_db(
    id: &str,
    connection_info: Option<ConnectionInfo>,
    table: &mut DbTable,
    options: ReplicateOptions,
    api: &Arc<dyn ServerApi>,
) -> Result<(bool, LocalDb), EngineError> {
    let entry = table
        .get_mut(id)
        .ok_or_else(|| EngineError::StoreNotInitialized(id.to_string()))?;

    let Some(info) = connection_info else {
        entry.remote = None;
        return Ok((false, entry.clone()));
    };

    if let Some(remote) = &entry.remote {
        if remote.info == info && remote.options == options {
            return Ok((false, entry.clone()));
        }
    }

    // Configuration changed (or first configuration): tear down the old
    // connection and build a fresh link.
    if let Some(old) = entry.remote.take() {
        if let Some(connection) = old.connection {
            info!(store = %entry.local.name(), "closing replaced replication connection");
            connection.cancel();
        }
    }

    let remote = api.open_remote(&info)?;
    entry.remote = Some(RemoteLink {
        remote,
        connection: None,
        info,
        options,
    });
    reconcile_connection(entry);
    Ok((true, entry.clone()))
}

/// Bring the entry's running connection in line with its `is_sync` flag.
///
/// Syncing wanted: cancel any stale connection and start a fresh one
/// (push+pull when the options carry push settings, pull-only otherwise),
/// with the pull direction's attachment filter taken from the entry.
/// Syncing unwanted: cancel and clear. Anything else is a no-op.
pub fn reconcile_connection(entry: &mut LocalDb) {
    let Some(remote) = entry.remote.as_mut() else {
        return;
    };
    if entry.is_sync {
        if let Some(stale) = remote.connection.take() {
            stale.cancel();
        }
        let mut options = remote.options.clone();
        options.pull.download_attachments = entry.is_sync_attachments;
        let connection = replicate(entry.local.clone(), remote.remote.clone(), options);
        debug!(store = %entry.local.name(), link_id = connection.link_id(),
            "started replication connection");
        remote.connection = Some(connection);
    } else if let Some(connection) = remote.connection.take() {
        debug!(store = %entry.local.name(), link_id = connection.link_id(),
            "cancelled replication connection");
        connection.cancel();
    } else {
        debug!(store = %entry.local.name(), "sync disabled and no connection; nothing to reconcile");
    }
}
