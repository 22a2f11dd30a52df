//! ActiveStore - persisted activation decisions.
//!
//! Wraps the `active` document store. Its records are the only state that
//! must survive a process restart: the engine re-derives everything else
//! from them on the next self-healing pass.

use crate::doc_store::{DocStore, StoreError};
use outpost_model::{ActiveProjectRecord, FullProjectId};
use std::sync::Arc;

#[derive(Clone)]
pub struct ActiveStore {
    db: Arc<DocStore>,
}

impl ActiveStore {
    pub fn new(db: Arc<DocStore>) -> Self {
        Self { db }
    }

    pub fn store(&self) -> &Arc<DocStore> {
        &self.db
    }

    pub fn put(&self, record: &ActiveProjectRecord) -> Result<(), StoreError> {
        self.db.put_as(record.id.as_str(), record)?;
        Ok(())
    }

    pub fn get(&self, id: &FullProjectId) -> Result<Option<ActiveProjectRecord>, StoreError> {
        self.db.get_as(id.as_str())
    }

    pub fn list(&self) -> Result<Vec<ActiveProjectRecord>, StoreError> {
        self.db.all_as()
    }

    pub fn remove(&self, id: &FullProjectId) -> Result<(), StoreError> {
        self.db.remove(id.as_str())?;
        Ok(())
    }

    /// Persist a new sync flag, returning the updated record.
    pub fn set_sync(
        &self,
        id: &FullProjectId,
        is_sync: bool,
    ) -> Result<ActiveProjectRecord, StoreError> {
        let mut record = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.is_sync = is_sync;
        self.put(&record)?;
        Ok(record)
    }

    /// Persist a new attachment-sync flag, returning the updated record.
    pub fn set_sync_attachments(
        &self,
        id: &FullProjectId,
        is_sync_attachments: bool,
    ) -> Result<ActiveProjectRecord, StoreError> {
        let mut record = self
            .get(id)?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        record.is_sync_attachments = is_sync_attachments;
        self.put(&record)?;
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outpost_model::{ListingId, ProjectId};

    fn record(listing: &str, project: &str) -> ActiveProjectRecord {
        let listing_id = ListingId::from(listing);
        let project_id = ProjectId::from(project);
        ActiveProjectRecord {
            id: FullProjectId::resolve(&listing_id, &project_id),
            listing_id,
            project_id,
            is_sync: true,
            is_sync_attachments: false,
            friendly_name: None,
            username: None,
        }
    }

    #[test]
    fn put_list_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ActiveStore::new(Arc::new(
            DocStore::open(tmp.path().join("active.redb"), "active").unwrap(),
        ));

        let a = record("srv", "proj-a");
        let b = record("srv", "proj-b");
        store.put(&a).unwrap();
        store.put(&b).unwrap();
        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.get(&a.id).unwrap().unwrap(), a);

        store.remove(&a.id).unwrap();
        assert!(store.get(&a.id).unwrap().is_none());
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn sync_flags_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let store = ActiveStore::new(Arc::new(
            DocStore::open(tmp.path().join("active.redb"), "active").unwrap(),
        ));

        let rec = record("srv", "proj");
        store.put(&rec).unwrap();

        let updated = store.set_sync(&rec.id, false).unwrap();
        assert!(!updated.is_sync);
        assert!(!store.get(&rec.id).unwrap().unwrap().is_sync);

        let updated = store.set_sync_attachments(&rec.id, true).unwrap();
        assert!(updated.is_sync_attachments);

        let missing = FullProjectId::from("nope||nothing");
        assert!(matches!(
            store.set_sync(&missing, true),
            Err(StoreError::NotFound(_))
        ));
    }
}
