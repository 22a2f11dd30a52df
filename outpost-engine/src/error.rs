//! Engine error type.
//!
//! Replication failures are deliberately absent: they surface as events on
//! the bus, never as `Err` into caller code.

use outpost_model::{FullProjectId, IdError, ListingId};
use outpost_replication::RemoteError;
use outpost_store::StoreError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("id error: {0}")]
    Id(#[from] IdError),

    /// Programmer error: the replication link manager was called for a
    /// store the registry has never created.
    #[error("local database {0} must be initialized before configuring replication")]
    StoreNotInitialized(String),

    #[error("project ids may not start with a reserved prefix: {0}")]
    ReservedProjectId(String),

    /// Fatal after a successful activation write; the orphaned active
    /// record is recovered by the next self-healing pass.
    #[error("active project {0} is not known")]
    UnknownProject(FullProjectId),

    #[error("listing {0} is not known")]
    UnknownListing(ListingId),

    /// Configuration error, fatal and synchronous: continuing would
    /// silently point replication at the wrong host.
    #[error("connection for database {0} has no base url")]
    MisconfiguredConnection(String),

    #[error("engine state lock poisoned")]
    LockPoisoned,
}
