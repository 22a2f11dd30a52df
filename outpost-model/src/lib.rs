//! Outpost Model
//!
//! Shared types for the Outpost sync engine:
//! - **Ids**: listing/project identifier newtypes and the full-id join
//! - **Records**: listings, active-project records, project documents
//! - **Connections**: remote connection descriptors and replication options
//! - **Events**: the engine lifecycle event enum

pub mod event;
pub mod ids;
pub mod records;

pub use event::{ChangeKind, SyncEvent};
pub use ids::{FullProjectId, IdError, ListingId, ProjectId, ID_SEPARATOR};
pub use records::{
    ActiveProjectRecord, BasicCredentials, Checkpoint, ConnectionInfo, Listing,
    PossibleConnection, ProjectDoc, PullOptions, PushOptions, ReplicateOptions,
    DEFAULT_BATCHES_LIMIT, DEFAULT_BATCH_SIZE, DEFAULT_LISTING_ID,
};
