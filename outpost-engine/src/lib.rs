//! Outpost Engine
//!
//! The hierarchical multi-database replication and sync-state engine:
//! - **EventBus**: typed lifecycle events, synchronous in-order fan-out
//! - **Local Store Registry**: idempotent (prefix, id) → store bring-up
//! - **Replication Link Manager**: desired-state reconciliation of links
//! - **Sync-State Aggregator**: settlement maps and aggregate flags
//! - **Project Lifecycle Manager**: activation, self-healing, teardown
//! - **Listener Subscription Protocol**: feeds that survive store recreation
//! - **Sync Toggle Controller**: per-project sync and attachment switches
//!
//! The engine is a library: it has no CLI or HTTP surface of its own and is
//! driven by UI event handlers through [`SyncEngine`]'s methods.

pub mod directory;
pub mod engine;
pub mod error;
pub mod events;
pub mod link_manager;
pub mod listeners;
pub mod projects;
pub mod registry;
pub mod sync_state;
pub mod sync_toggle;

pub use engine::{SyncEngine, SyncEngineBuilder};
pub use error::EngineError;
pub use events::{EventBus, HandlerError, SubscriptionId};
pub use link_manager::{ensure_synced_db, reconcile_connection};
pub use listeners::{
    ErrorListener, ErrorSink, Listened, ListenerError, ProjectListener, ProjectSubscription,
    Teardown,
};
pub use projects::UI_SPECIFICATION_ID;
pub use registry::{
    ensure_local_db, CreatedListing, CreatedProject, DbTable, LocalDb, RemoteLink,
    PREFIX_ACTIVE, PREFIX_DATA, PREFIX_DIRECTORY, PREFIX_LOCAL_AUTH, PREFIX_LOCAL_STATE,
    PREFIX_METADATA, PREFIX_PROJECTS,
};
pub use sync_state::{
    register_automerge_resolver, register_sync_state, ConflictResolver, SyncStateSummary,
};

// Re-export the collaborator surfaces consumers wire in.
pub use outpost_model as model;
pub use outpost_replication::{
    NullStatusSink, RemoteError, RemoteStore, ServerApi, SyncStatusSink,
};
pub use outpost_store::{ChangeEvent, ChangeOrigin, DataDir, DocStore};
