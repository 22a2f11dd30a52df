//! Persisted record types and replication configuration.
//!
//! `ConnectionInfo` and `ReplicateOptions` derive `PartialEq`: the link
//! manager skips reconfiguration when the requested configuration is
//! structurally equal to the one already applied, so equality here is the
//! thrash-prevention contract.

use crate::ids::{FullProjectId, ListingId, ProjectId};
use serde::{Deserialize, Serialize};

/// The listing id used for a bundled/default server, which is allowed to
/// have an incomplete connection configuration.
pub const DEFAULT_LISTING_ID: &str = "default";

/// Documents pulled or pushed per replication request.
pub const DEFAULT_BATCH_SIZE: usize = 1000;

/// Maximum batches processed per replication wake-up.
pub const DEFAULT_BATCHES_LIMIT: usize = 10;

/// A registered remote server hosting one or more projects.
///
/// Stored as a document in the `directory` store, keyed by `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Root URL of the server API; `None` only for local-only listings.
    #[serde(default)]
    pub base_url: Option<String>,
    /// Connection overlay for the listing's remote projects store, if the
    /// server publishes one.
    #[serde(default)]
    pub projects_db: Option<PossibleConnection>,
    #[serde(default)]
    pub local_only: bool,
    /// Database name prefix advertised by the server.
    #[serde(default)]
    pub prefix: String,
}

/// The device-local decision to sync a project. The only record that must
/// survive a process restart for the engine to self-heal.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActiveProjectRecord {
    pub id: FullProjectId,
    pub listing_id: ListingId,
    pub project_id: ProjectId,
    pub is_sync: bool,
    pub is_sync_attachments: bool,
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Username the project was activated under, when known.
    #[serde(default)]
    pub username: Option<String>,
}

/// A row of a listing's projects store.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProjectDoc {
    pub id: ProjectId,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub created: Option<String>,
    #[serde(default)]
    pub last_updated: Option<String>,
    #[serde(default)]
    pub metadata_db: Option<PossibleConnection>,
    #[serde(default)]
    pub data_db: Option<PossibleConnection>,
}

/// A partial connection overlay, as served by a listing's project records.
/// Fields present here override the derived [`ConnectionInfo`] defaults.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct PossibleConnection {
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    #[serde(default)]
    pub lan: Option<bool>,
    #[serde(default)]
    pub jwt_token: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BasicCredentials {
    pub username: String,
    pub password: String,
}

/// Fully resolved remote database connection descriptor.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub proto: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    /// Root URL the database name is appended to. Required: a descriptor
    /// without it is a configuration error, never a localhost fallback.
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub lan: bool,
    pub db_name: String,
    #[serde(default)]
    pub auth: Option<BasicCredentials>,
    #[serde(default)]
    pub jwt_token: Option<String>,
}

impl ConnectionInfo {
    /// Apply a partial overlay; fields set in the overlay win.
    pub fn overlay(mut self, overlay: &PossibleConnection) -> Self {
        if let Some(proto) = &overlay.proto {
            self.proto = Some(proto.clone());
        }
        if let Some(host) = &overlay.host {
            self.host = Some(host.clone());
        }
        if let Some(port) = overlay.port {
            self.port = Some(port);
        }
        if let Some(base_url) = &overlay.base_url {
            self.base_url = Some(base_url.clone());
        }
        if let Some(db_name) = &overlay.db_name {
            self.db_name = db_name.clone();
        }
        if let Some(lan) = overlay.lan {
            self.lan = lan;
        }
        if let Some(token) = &overlay.jwt_token {
            self.jwt_token = Some(token.clone());
        }
        self
    }

    /// Full URL of the remote database, if the descriptor is complete.
    pub fn database_url(&self) -> Option<String> {
        let base = self.base_url.as_deref()?;
        Some(if base.ends_with('/') {
            format!("{}{}", base, self.db_name)
        } else {
            format!("{}/{}", base, self.db_name)
        })
    }
}

/// Replication checkpoint side.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Checkpoint {
    Source,
    Target,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PushOptions {
    pub checkpoint: Checkpoint,
}

impl Default for PushOptions {
    fn default() -> Self {
        Self {
            checkpoint: Checkpoint::Source,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PullOptions {
    pub checkpoint: Checkpoint,
    /// Pull large-binary attachment content. Off by default; the pull
    /// direction filters attachments out unless this is set.
    pub download_attachments: bool,
}

impl Default for PullOptions {
    fn default() -> Self {
        Self {
            checkpoint: Checkpoint::Target,
            download_attachments: false,
        }
    }
}

/// Configuration of one replication link. Pull is always configured; the
/// presence of `push` selects a two-way link.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReplicateOptions {
    pub live: bool,
    pub retry: bool,
    pub timeout_ms: u64,
    pub batch_size: usize,
    pub batches_limit: usize,
    pub pull: PullOptions,
    pub push: Option<PushOptions>,
}

impl Default for ReplicateOptions {
    fn default() -> Self {
        Self {
            live: true,
            retry: true,
            timeout_ms: 15_000,
            batch_size: DEFAULT_BATCH_SIZE,
            batches_limit: DEFAULT_BATCHES_LIMIT,
            pull: PullOptions::default(),
            push: None,
        }
    }
}

impl ReplicateOptions {
    /// Two-way configuration with default push and pull sub-options.
    pub fn two_way() -> Self {
        Self {
            push: Some(PushOptions::default()),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_fields_win() {
        let base = ConnectionInfo {
            db_name: "data-survey".to_string(),
            jwt_token: Some("tok".to_string()),
            ..ConnectionInfo::default()
        };
        let overlay = PossibleConnection {
            base_url: Some("https://db.example.org".to_string()),
            db_name: Some("custom-name".to_string()),
            ..PossibleConnection::default()
        };
        let merged = base.overlay(&overlay);
        assert_eq!(merged.db_name, "custom-name");
        assert_eq!(merged.base_url.as_deref(), Some("https://db.example.org"));
        assert_eq!(merged.jwt_token.as_deref(), Some("tok"));
    }

    #[test]
    fn database_url_requires_base() {
        let mut info = ConnectionInfo {
            db_name: "data-x".to_string(),
            ..ConnectionInfo::default()
        };
        assert!(info.database_url().is_none());

        info.base_url = Some("https://db.example.org/".to_string());
        assert_eq!(
            info.database_url().unwrap(),
            "https://db.example.org/data-x"
        );
    }

    #[test]
    fn structural_equality_ignores_construction_order() {
        // The link manager compares values, not serialized text, so two
        // descriptors built field-by-field in different orders are equal.
        let a = ConnectionInfo {
            jwt_token: Some("t".to_string()),
            base_url: Some("https://db".to_string()),
            db_name: "d".to_string(),
            ..ConnectionInfo::default()
        };
        let b = ConnectionInfo {
            db_name: "d".to_string(),
            base_url: Some("https://db".to_string()),
            jwt_token: Some("t".to_string()),
            ..ConnectionInfo::default()
        };
        assert_eq!(a, b);
    }
}
