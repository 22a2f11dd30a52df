//! DocStore - a device-local persistent document store with a change feed.
//!
//! Tables:
//! - docs: id → JSON document bytes
//! - doc_seqs: id → sequence of the latest write (tombstones survive deletes)
//! - meta: key → u64 (`update_seq` counter)
//!
//! Writes are short redb transactions; the paired change event is published
//! synchronously after commit, before the call returns.

use crate::feed::{ChangeEvent, ChangeFeed, ChangeOrigin};
use redb::{Database, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value as Json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tracing::debug;

const DOCS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("docs");
// id → (sequence of latest write, origin tag)
const DOC_SEQS_TABLE: TableDefinition<&str, (u64, u8)> = TableDefinition::new("doc_seqs");
const META_TABLE: TableDefinition<&str, u64> = TableDefinition::new("meta");

const META_UPDATE_SEQ: &str = "update_seq";

const ORIGIN_LOCAL: u8 = 0;
const ORIGIN_REPLICATION: u8 = 1;

fn origin_tag(origin: ChangeOrigin) -> u8 {
    match origin {
        ChangeOrigin::Local => ORIGIN_LOCAL,
        ChangeOrigin::Replication => ORIGIN_REPLICATION,
    }
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] redb::DatabaseError),

    #[error("table error: {0}")]
    Table(#[from] redb::TableError),

    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),

    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),

    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("document not found: {0}")]
    NotFound(String),

    #[error("lock error: {0}")]
    Lock(String),
}

/// A persistent, replicable document store.
pub struct DocStore {
    name: String,
    path: PathBuf,
    db: Database,
    seq: AtomicU64,
    feed: ChangeFeed,
}

impl DocStore {
    /// Open or create a store at the given path.
    pub fn open(path: impl AsRef<Path>, name: impl Into<String>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        let db = Database::create(&path)?;

        // Ensure tables exist and recover the sequence counter.
        let write_txn = db.begin_write()?;
        let update_seq = {
            let _ = write_txn.open_table(DOCS_TABLE)?;
            let _ = write_txn.open_table(DOC_SEQS_TABLE)?;
            let meta = write_txn.open_table(META_TABLE)?;
            let seq = meta.get(META_UPDATE_SEQ)?.map(|v| v.value()).unwrap_or(0);
            seq
        };
        write_txn.commit()?;

        Ok(Self {
            name: name.into(),
            path,
            db,
            seq: AtomicU64::new(update_seq),
            feed: ChangeFeed::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The store's live change feed.
    pub fn changes(&self) -> &ChangeFeed {
        &self.feed
    }

    /// Sequence number of the most recent write.
    pub fn update_seq(&self) -> u64 {
        self.seq.load(Ordering::SeqCst)
    }

    /// Write a document from local code.
    pub fn put(&self, id: &str, body: &Json) -> Result<u64, StoreError> {
        self.write(id, Some(body), ChangeOrigin::Local)
    }

    /// Write a document applied by a replication link. A byte-identical
    /// body is a no-op so pull/push pairs cannot echo documents forever.
    pub fn put_replicated(&self, id: &str, body: &Json) -> Result<u64, StoreError> {
        if self.get(id)?.as_ref() == Some(body) {
            return Ok(self.update_seq());
        }
        self.write(id, Some(body), ChangeOrigin::Replication)
    }

    /// Serialize and write a typed record.
    pub fn put_as<T: Serialize>(&self, id: &str, value: &T) -> Result<u64, StoreError> {
        self.put(id, &serde_json::to_value(value)?)
    }

    /// Delete a document from local code.
    pub fn remove(&self, id: &str) -> Result<u64, StoreError> {
        self.write(id, None, ChangeOrigin::Local)
    }

    /// Delete a document applied by a replication link. Deleting an absent
    /// document is a no-op.
    pub fn remove_replicated(&self, id: &str) -> Result<u64, StoreError> {
        if self.get(id)?.is_none() {
            return Ok(self.update_seq());
        }
        self.write(id, None, ChangeOrigin::Replication)
    }

    fn write(
        &self,
        id: &str,
        body: Option<&Json>,
        origin: ChangeOrigin,
    ) -> Result<u64, StoreError> {
        let bytes = body.map(serde_json::to_vec).transpose()?;
        let write_txn = self.db.begin_write()?;
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut docs = write_txn.open_table(DOCS_TABLE)?;
            match &bytes {
                Some(b) => {
                    docs.insert(id, b.as_slice())?;
                }
                None => {
                    docs.remove(id)?;
                }
            }
            let mut seqs = write_txn.open_table(DOC_SEQS_TABLE)?;
            seqs.insert(id, (seq, origin_tag(origin)))?;
            let mut meta = write_txn.open_table(META_TABLE)?;
            meta.insert(META_UPDATE_SEQ, seq)?;
        }
        write_txn.commit()?;

        self.feed.publish(ChangeEvent {
            seq,
            id: id.to_string(),
            deleted: body.is_none(),
            doc: body.cloned(),
            origin,
        });
        Ok(seq)
    }

    pub fn get(&self, id: &str) -> Result<Option<Json>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCS_TABLE)?;
        match docs.get(id)? {
            Some(value) => Ok(Some(serde_json::from_slice(value.value())?)),
            None => Ok(None),
        }
    }

    /// Read and deserialize a typed record.
    pub fn get_as<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>, StoreError> {
        match self.get(id)? {
            Some(body) => Ok(Some(serde_json::from_value(body)?)),
            None => Ok(None),
        }
    }

    /// All live documents, ordered by id.
    pub fn all_docs(&self) -> Result<Vec<(String, Json)>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let docs = read_txn.open_table(DOCS_TABLE)?;
        let mut out = Vec::new();
        for result in docs.iter()? {
            let (key, value) = result?;
            out.push((key.value().to_string(), serde_json::from_slice(value.value())?));
        }
        Ok(out)
    }

    /// All live documents deserialized as `T`, ordered by id.
    pub fn all_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, StoreError> {
        self.all_docs()?
            .into_iter()
            .map(|(_, body)| serde_json::from_value(body).map_err(StoreError::from))
            .collect()
    }

    /// Changes after `since`, oldest first, at most `limit`. Deletes appear
    /// as tombstone events.
    pub fn changes_since(&self, since: u64, limit: usize) -> Result<Vec<ChangeEvent>, StoreError> {
        self.scan_changes(since, limit, None)
    }

    /// Like [`changes_since`](Self::changes_since), restricted to writes
    /// that originated locally. The push direction of a replication link
    /// scans this so pulled documents are never echoed back to the remote.
    pub fn local_changes_since(
        &self,
        since: u64,
        limit: usize,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        self.scan_changes(since, limit, Some(ChangeOrigin::Local))
    }

    fn scan_changes(
        &self,
        since: u64,
        limit: usize,
        origin_filter: Option<ChangeOrigin>,
    ) -> Result<Vec<ChangeEvent>, StoreError> {
        let read_txn = self.db.begin_read()?;
        let seqs = read_txn.open_table(DOC_SEQS_TABLE)?;
        let docs = read_txn.open_table(DOCS_TABLE)?;

        let mut changed: Vec<(u64, u8, String)> = Vec::new();
        for result in seqs.iter()? {
            let (key, value) = result?;
            let (seq, origin) = value.value();
            if seq <= since {
                continue;
            }
            if let Some(filter) = origin_filter {
                if origin != origin_tag(filter) {
                    continue;
                }
            }
            changed.push((seq, origin, key.value().to_string()));
        }
        changed.sort_unstable_by_key(|(seq, _, _)| *seq);
        changed.truncate(limit);

        let mut out = Vec::with_capacity(changed.len());
        for (seq, origin, id) in changed {
            let doc = match docs.get(id.as_str())? {
                Some(value) => Some(serde_json::from_slice(value.value())?),
                None => None,
            };
            out.push(ChangeEvent {
                seq,
                deleted: doc.is_none(),
                doc,
                id,
                origin: if origin == ORIGIN_REPLICATION {
                    ChangeOrigin::Replication
                } else {
                    ChangeOrigin::Local
                },
            });
        }
        Ok(out)
    }

    /// Cancel the change feed and unlink the backing file. The open handle
    /// keeps working against the unlinked inode until dropped.
    pub fn destroy(&self) -> Result<(), StoreError> {
        self.feed.cancel();
        debug!(store = %self.name, "destroying store");
        std::fs::remove_file(&self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn open_store() -> (tempfile::TempDir, DocStore) {
        let tmp = tempfile::tempdir().unwrap();
        let store = DocStore::open(tmp.path().join("test.redb"), "test").unwrap();
        (tmp, store)
    }

    #[test]
    fn put_get_remove() {
        let (_tmp, store) = open_store();
        store.put("rec-1", &json!({"name": "site A"})).unwrap();
        assert_eq!(
            store.get("rec-1").unwrap().unwrap()["name"],
            json!("site A")
        );

        store.remove("rec-1").unwrap();
        assert!(store.get("rec-1").unwrap().is_none());
    }

    #[test]
    fn sequence_survives_reopen() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("test.redb");
        {
            let store = DocStore::open(&path, "test").unwrap();
            store.put("a", &json!(1)).unwrap();
            store.put("b", &json!(2)).unwrap();
            assert_eq!(store.update_seq(), 2);
        }
        let store = DocStore::open(&path, "test").unwrap();
        assert_eq!(store.update_seq(), 2);
        let seq = store.put("c", &json!(3)).unwrap();
        assert_eq!(seq, 3);
    }

    #[test]
    fn changes_since_orders_and_tombstones() {
        let (_tmp, store) = open_store();
        store.put("a", &json!(1)).unwrap();
        store.put("b", &json!(2)).unwrap();
        store.remove("a").unwrap();

        let changes = store.changes_since(0, 10).unwrap();
        assert_eq!(changes.len(), 2);
        // "a" was rewritten by the delete, so it sorts after "b".
        assert_eq!(changes[0].id, "b");
        assert_eq!(changes[1].id, "a");
        assert!(changes[1].deleted);

        let newer = store.changes_since(2, 10).unwrap();
        assert_eq!(newer.len(), 1);
        assert_eq!(newer[0].id, "a");
    }

    #[test]
    fn local_changes_exclude_replicated_writes() {
        let (_tmp, store) = open_store();
        store.put("mine", &json!({"v": 1})).unwrap();
        store.put_replicated("theirs", &json!({"v": 2})).unwrap();

        let local = store.local_changes_since(0, 10).unwrap();
        assert_eq!(local.len(), 1);
        assert_eq!(local[0].id, "mine");

        let all = store.changes_since(0, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[test]
    fn replicated_writes_are_idempotent() {
        let (_tmp, store) = open_store();
        store.put_replicated("a", &json!({"v": 1})).unwrap();
        let seq = store.update_seq();
        // Identical body: no new sequence, no event.
        store.put_replicated("a", &json!({"v": 1})).unwrap();
        assert_eq!(store.update_seq(), seq);
        // Deleting something absent is also a no-op.
        store.remove_replicated("ghost").unwrap();
        assert_eq!(store.update_seq(), seq);

        store.put_replicated("a", &json!({"v": 2})).unwrap();
        assert_eq!(store.update_seq(), seq + 1);
    }

    #[tokio::test]
    async fn writes_publish_change_events() {
        let (_tmp, store) = open_store();
        let mut rx = store.changes().subscribe();
        store.put("a", &json!({"x": 1})).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.id, "a");
        assert_eq!(ev.origin, ChangeOrigin::Local);
        assert!(!ev.deleted);

        store.put_replicated("b", &json!({"y": 2})).unwrap();
        let ev = rx.recv().await.unwrap();
        assert_eq!(ev.origin, ChangeOrigin::Replication);
    }
}
