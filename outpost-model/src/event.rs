//! Engine lifecycle events.
//!
//! Ordering contract: the `*Update` (or `*Error`) event for an entity is
//! emitted and fully delivered to synchronous subscribers before the call
//! stack that produced it reaches its next suspension point, so a subscriber
//! can attach a change-feed listener from inside the handler without missing
//! anything.
//!
//! `MetaSyncState`/`DataSyncState` pairs for a given project strictly
//! alternate, `syncing: true` first, and bracket the period during which the
//! store's initial synchronization is in flight.

use crate::ids::{FullProjectId, ListingId};

/// How an entity's existence changed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Create,
    Update,
    Delete,
}

#[derive(Clone, Debug)]
pub enum SyncEvent {
    /// A listing was created, updated, or deleted. `projects_changed` is set
    /// when the listing's local projects store was just (re)created.
    ListingUpdate {
        kind: ChangeKind,
        projects_changed: bool,
        listing_id: ListingId,
    },
    ListingError {
        listing_id: ListingId,
        error: String,
    },
    /// Brackets the directory refresh pass.
    ListingsSyncState { syncing: bool },
    /// Brackets the initial synchronization of one listing's projects store.
    ProjectsSyncState {
        syncing: bool,
        listing_id: ListingId,
    },
    /// A project entry was created, updated, or deleted. The `*_changed`
    /// flags are set when the respective local store was just (re)created.
    ProjectUpdate {
        kind: ChangeKind,
        meta_changed: bool,
        data_changed: bool,
        project_id: FullProjectId,
    },
    ProjectError {
        project_id: FullProjectId,
        error: String,
    },
    /// Brackets the initial synchronization of one project's metadata store.
    MetaSyncState {
        syncing: bool,
        project_id: FullProjectId,
    },
    /// Brackets the initial synchronization of one project's data store.
    DataSyncState {
        syncing: bool,
        project_id: FullProjectId,
    },
    DirectoryError { error: String },
    /// Emitted after every aggregator update, even when no flag changed, so
    /// pollers can use it as a wake-up signal.
    AllState,
}
