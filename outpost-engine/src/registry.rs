//! Local store registry types and the `ensure_local_db` operation.
//!
//! A registry table maps a logical id to its [`LocalDb`] ownership triple.
//! `ensure_local_db` is purely local bring-up: it never opens network
//! connections and is safe to call any number of times.

use crate::error::EngineError;
use outpost_model::{
    ActiveProjectRecord, ConnectionInfo, Listing, ProjectDoc, ReplicateOptions,
};
use outpost_replication::{RemoteStore, ReplicationHandle};
use outpost_store::{ChangeFeed, DocStore, StorePool};
use std::collections::HashMap;
use std::sync::Arc;

/// Store-name prefixes; one logical store per (prefix, id) pair.
pub const PREFIX_DIRECTORY: &str = "directory";
pub const PREFIX_ACTIVE: &str = "active";
pub const PREFIX_PROJECTS: &str = "projects";
pub const PREFIX_METADATA: &str = "metadata";
pub const PREFIX_DATA: &str = "data";
pub const PREFIX_LOCAL_AUTH: &str = "local_auth";
pub const PREFIX_LOCAL_STATE: &str = "local_state";

/// A local store, its live change feed, the desired sync flags, and the
/// remote link once one has been configured.
#[derive(Clone)]
pub struct LocalDb {
    pub local: Arc<DocStore>,
    pub changes: ChangeFeed,
    pub is_sync: bool,
    pub is_sync_attachments: bool,
    pub remote: Option<RemoteLink>,
}

/// The remote half of a replication pair. `connection` is present iff
/// replication is currently desired and the configuration has not been
/// invalidated since it was started.
#[derive(Clone)]
pub struct RemoteLink {
    pub remote: Arc<dyn RemoteStore>,
    pub connection: Option<ReplicationHandle>,
    /// Last-applied configuration; re-application with an equal value is
    /// skipped.
    pub info: ConnectionInfo,
    pub options: ReplicateOptions,
}

/// Registry table: logical id → local database entry.
pub type DbTable = HashMap<String, LocalDb>;

/// In-memory join of a listing and its local projects store.
#[derive(Clone)]
pub struct CreatedListing {
    pub listing: Listing,
    pub projects: LocalDb,
}

/// In-memory join of an activated project and its live local stores.
/// Exists only while the project is activated; created, replaced, and
/// deleted by the lifecycle manager, read-only everywhere else.
#[derive(Clone)]
pub struct CreatedProject {
    pub project: ProjectDoc,
    pub active: ActiveProjectRecord,
    pub meta: LocalDb,
    pub data: LocalDb,
}

/// Get or create the local store for (prefix, id).
///
/// An existing entry has only its `is_sync` flag overwritten; the change
/// feed and remote link are untouched. A new entry is opened through the
/// pool, its change feed handle taken, and inserted with no remote.
pub fn ensure_local_db(
    pool: &StorePool,
    prefix: &str,
    id: &str,
    start_syncing: bool,
    table: &mut DbTable,
    start_syncing_attachments: bool,
) -> Result<(bool, LocalDb), EngineError> {
    if let Some(entry) = table.get_mut(id) {
        entry.is_sync = start_syncing;
        return Ok((false, entry.clone()));
    }

    let store = pool.get_or_open(prefix, id)?;
    let entry = LocalDb {
        changes: store.changes().clone(),
        local: store,
        is_sync: start_syncing,
        is_sync_attachments: start_syncing_attachments,
        remote: None,
    };
    table.insert(id.to_string(), entry.clone());
    Ok((true, entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_store::DataDir;

    #[test]
    fn ensure_local_db_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(tmp.path());
        data_dir.ensure_dirs().unwrap();
        let pool = StorePool::new(data_dir);
        let mut table = DbTable::new();

        let (created, first) =
            ensure_local_db(&pool, PREFIX_DATA, "srv||proj", true, &mut table, false).unwrap();
        assert!(created);
        assert!(first.is_sync);
        assert!(first.remote.is_none());

        let (created, second) =
            ensure_local_db(&pool, PREFIX_DATA, "srv||proj", false, &mut table, false).unwrap();
        assert!(!created);
        // Same underlying store instance; only the sync flag moved.
        assert!(Arc::ptr_eq(&first.local, &second.local));
        assert!(!second.is_sync);
        assert_eq!(table.len(), 1);
    }
}
