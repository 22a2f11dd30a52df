//! StorePool - get-or-open cache of prefixed document stores.
//!
//! A (prefix, id) pair always resolves to the same open [`DocStore`] for the
//! life of the process: registry entries may come and go as projects are
//! activated and deactivated, but the underlying store handle (and its redb
//! file lock) is opened once and reused.

use crate::data_dir::{DataDir, NAME_SEPARATOR};
use crate::doc_store::{DocStore, StoreError};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::info;

pub struct StorePool {
    data_dir: DataDir,
    stores: Mutex<HashMap<String, Arc<DocStore>>>,
}

impl StorePool {
    pub fn new(data_dir: DataDir) -> Self {
        Self {
            data_dir,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn data_dir(&self) -> &DataDir {
        &self.data_dir
    }

    /// Open the store for (prefix, id), or return the cached handle.
    pub fn get_or_open(&self, prefix: &str, id: &str) -> Result<Arc<DocStore>, StoreError> {
        let name = format!("{}{}{}", prefix, NAME_SEPARATOR, id);
        let mut stores = self
            .stores
            .lock()
            .map_err(|_| StoreError::Lock("store pool lock poisoned".into()))?;
        if let Some(store) = stores.get(&name) {
            return Ok(store.clone());
        }
        let path = self.data_dir.store_db(prefix, id);
        let store = Arc::new(DocStore::open(path, name.clone())?);
        info!(store = %name, "opened local store");
        stores.insert(name, store.clone());
        Ok(store)
    }

    /// Cancel every feed and unlink every pooled store. Used by wipe.
    pub fn destroy_all(&self) {
        let drained: Vec<(String, Arc<DocStore>)> = {
            let Ok(mut stores) = self.stores.lock() else {
                return;
            };
            stores.drain().collect()
        };
        for (name, store) in drained {
            if let Err(e) = store.destroy() {
                tracing::warn!(store = %name, error = %e, "failed to destroy store");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_or_open_returns_same_handle() {
        let tmp = tempfile::tempdir().unwrap();
        let data_dir = DataDir::new(tmp.path());
        data_dir.ensure_dirs().unwrap();
        let pool = StorePool::new(data_dir);

        let a = pool.get_or_open("data", "srv||proj").unwrap();
        let b = pool.get_or_open("data", "srv||proj").unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let other = pool.get_or_open("metadata", "srv||proj").unwrap();
        assert!(!Arc::ptr_eq(&a, &other));
    }
}
