//! Data directory management
//!
//! Paths for Outpost's persisted stores:
//! - `directory.redb` — known listings
//! - `active.redb` — activated project records
//! - `local_auth.redb` — per-listing credentials
//! - `local_state.redb` — app state kept across sessions
//! - `stores/{prefix}_{id}.redb` — per-listing and per-project stores

use std::path::{Path, PathBuf};

/// Separator between a store's prefix and its logical id in file names.
pub const NAME_SEPARATOR: char = '_';

#[derive(Debug, Clone)]
pub struct DataDir {
    base: PathBuf,
}

impl DataDir {
    /// Create a DataDir with a custom base path.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// Get the base directory path.
    pub fn base(&self) -> &Path {
        &self.base
    }

    /// Get the path to the directory (listings) database.
    pub fn directory_db(&self) -> PathBuf {
        self.base.join("directory.redb")
    }

    /// Get the path to the active-projects database.
    pub fn active_db(&self) -> PathBuf {
        self.base.join("active.redb")
    }

    /// Get the path to the local credentials database.
    pub fn auth_db(&self) -> PathBuf {
        self.base.join("local_auth.redb")
    }

    /// Get the path to the local app-state database.
    pub fn local_state_db(&self) -> PathBuf {
        self.base.join("local_state.redb")
    }

    /// Get the path to the prefixed stores directory.
    pub fn stores_dir(&self) -> PathBuf {
        self.base.join("stores")
    }

    /// Get the path to one prefixed store's database.
    ///
    /// The logical id may contain separator characters (full project ids
    /// do), so it is sanitized for the filesystem; the sanitized name is
    /// only a storage location, never parsed back.
    pub fn store_db(&self, prefix: &str, id: &str) -> PathBuf {
        let sanitized: String = id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                    c
                } else {
                    NAME_SEPARATOR
                }
            })
            .collect();
        self.stores_dir()
            .join(format!("{}{}{}.redb", prefix, NAME_SEPARATOR, sanitized))
    }

    /// Ensure base directories exist.
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base)?;
        std::fs::create_dir_all(self.stores_dir())?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_root_paths() {
        let dd = DataDir::new("/data/outpost");
        assert_eq!(dd.base(), Path::new("/data/outpost"));
        assert_eq!(dd.directory_db(), PathBuf::from("/data/outpost/directory.redb"));
        assert_eq!(dd.active_db(), PathBuf::from("/data/outpost/active.redb"));
        assert_eq!(dd.auth_db(), PathBuf::from("/data/outpost/local_auth.redb"));
    }

    #[test]
    fn test_store_paths_sanitize_ids() {
        let dd = DataDir::new("/data/outpost");
        assert_eq!(
            dd.store_db("projects", "srv.example.org"),
            PathBuf::from("/data/outpost/stores/projects_srv.example.org.redb")
        );
        // Full project ids contain the `||` join.
        assert_eq!(
            dd.store_db("data", "srv.example.org||survey/1"),
            PathBuf::from("/data/outpost/stores/data_srv.example.org__survey_1.redb")
        );
    }
}
