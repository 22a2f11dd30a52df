//! ServerApi - the engine's view of a listing's server.
//!
//! Covers the directory bootstrap (`/api/info`), the per-listing project
//! directory, the project metadata fetch, and the remote-store factory the
//! link manager uses to open replication targets. Tests substitute an
//! in-memory implementation.

use crate::remote::{RemoteError, RemoteStore};
use async_trait::async_trait;
use outpost_model::{ConnectionInfo, Listing, ProjectDoc, ProjectId};
use serde_json::Value as Json;
use std::sync::Arc;

#[async_trait]
pub trait ServerApi: Send + Sync {
    /// `GET {url}/api/info`: describe the server as a [`Listing`].
    async fn fetch_info(&self, url: &str) -> Result<Listing, RemoteError>;

    /// List the projects the server offers to the bearer of `token`.
    async fn fetch_directory(
        &self,
        listing: &Listing,
        token: Option<&str>,
    ) -> Result<Vec<ProjectDoc>, RemoteError>;

    /// Fetch a project's metadata bundle (UI specification and friends).
    async fn fetch_project_metadata(
        &self,
        listing: &Listing,
        project_id: &ProjectId,
        token: Option<&str>,
    ) -> Result<Json, RemoteError>;

    /// Build a handle to a named remote database. Synchronous and fallible:
    /// a descriptor without a base URL is a configuration error, not a
    /// localhost fallback.
    fn open_remote(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteStore>, RemoteError>;
}
