//! Outpost Replication
//!
//! The replication seam of the Outpost sync engine:
//! - **RemoteStore**: object-safe access to a remote document database
//! - **replicate / ReplicationHandle**: a live, cancellable pull or
//!   push+pull task with retry and bounded batches
//! - **ServerApi**: directory, metadata, and remote-store factory calls
//! - **SyncStatusSink / ThrottledStatus**: sync-activity indicator pings
//!
//! The wire format behind `RemoteStore` is a collaborator, not part of this
//! engine; `HttpServerApi` is the production implementation and tests swap
//! in in-memory ones.

pub mod http;
pub mod remote;
pub mod replicate;
pub mod server_api;
pub mod status;

pub use http::{HttpRemoteStore, HttpServerApi};
pub use remote::{ChangeBatch, RemoteChange, RemoteError, RemoteStore};
pub use replicate::{replicate, ReplicationEvent, ReplicationHandle};
pub use server_api::ServerApi;
pub use status::{NullStatusSink, SyncStatusSink, ThrottledStatus};
