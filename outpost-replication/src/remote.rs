//! RemoteStore - object-safe access to a remote document database.
//!
//! The trait is the boundary between the engine and the replication wire
//! protocol. Implementors map their transport errors into [`RemoteError`];
//! the engine only distinguishes "waiting on credentials" (401) from
//! everything else.

use async_trait::async_trait;
use serde_json::Value as Json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RemoteError {
    #[error("unauthorized")]
    Unauthorized,

    #[error("access denied: {0}")]
    Denied(String),

    #[error("network error: {0}")]
    Network(String),

    #[error("remote protocol error: {0}")]
    Protocol(String),

    /// Missing connection fields. Fatal and synchronous: continuing would
    /// silently target the wrong host.
    #[error("misconfigured connection: {0}")]
    Misconfigured(String),
}

impl RemoteError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, RemoteError::Unauthorized)
    }
}

/// One document change on the remote side.
#[derive(Clone, Debug)]
pub struct RemoteChange {
    pub seq: u64,
    pub id: String,
    pub deleted: bool,
    pub doc: Option<Json>,
}

/// A page of the remote changes feed.
#[derive(Clone, Debug, Default)]
pub struct ChangeBatch {
    pub changes: Vec<RemoteChange>,
    /// Checkpoint to resume from.
    pub last_seq: u64,
    /// More changes are immediately available after `last_seq`.
    pub pending: bool,
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Remote database name, for logging.
    fn name(&self) -> &str;

    /// Pull a page of changes after `since`. With `skip_attachments`, the
    /// remote excludes large-binary attachment content from the documents.
    async fn changes_since(
        &self,
        since: u64,
        limit: usize,
        skip_attachments: bool,
    ) -> Result<ChangeBatch, RemoteError>;

    /// Upsert a batch of documents (tombstones delete).
    async fn push(&self, docs: Vec<RemoteChange>) -> Result<(), RemoteError>;
}
