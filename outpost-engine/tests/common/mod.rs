//! In-memory server + remote store pair for engine scenario tests.
#![allow(dead_code)] // each test binary uses a different subset

use async_trait::async_trait;
use outpost_engine::{DataDir, SyncEngine, SyncEngineBuilder};
use outpost_model::{
    ConnectionInfo, FullProjectId, Listing, ListingId, PossibleConnection, ProjectDoc, ProjectId,
    SyncEvent,
};
use outpost_replication::{ChangeBatch, RemoteChange, RemoteError, RemoteStore, ServerApi};
use serde_json::{json, Value as Json};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub struct MemRemoteStore {
    name: String,
    pub docs: Mutex<BTreeMap<String, (u64, Option<Json>)>>,
    pub seq: AtomicU64,
}

impl MemRemoteStore {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            docs: Mutex::new(BTreeMap::new()),
            seq: AtomicU64::new(0),
        })
    }

    pub fn insert(&self, id: &str, doc: Json) {
        let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.docs
            .lock()
            .unwrap()
            .insert(id.to_string(), (seq, Some(doc)));
    }

    pub fn contains(&self, id: &str) -> bool {
        self.docs
            .lock()
            .unwrap()
            .get(id)
            .is_some_and(|(_, doc)| doc.is_some())
    }
}

#[async_trait]
impl RemoteStore for MemRemoteStore {
    fn name(&self) -> &str {
        &self.name
    }

    async fn changes_since(
        &self,
        since: u64,
        limit: usize,
        _skip_attachments: bool,
    ) -> Result<ChangeBatch, RemoteError> {
        let docs = self.docs.lock().unwrap();
        let mut changed: Vec<(&String, &(u64, Option<Json>))> = docs
            .iter()
            .filter(|(_, (seq, _))| *seq > since)
            .collect();
        changed.sort_by_key(|(_, (seq, _))| *seq);
        let pending = changed.len() > limit;
        changed.truncate(limit);
        let last_seq = changed.last().map(|(_, (seq, _))| *seq).unwrap_or(since);
        Ok(ChangeBatch {
            changes: changed
                .into_iter()
                .map(|(id, (seq, doc))| RemoteChange {
                    seq: *seq,
                    id: id.clone(),
                    deleted: doc.is_none(),
                    doc: doc.clone(),
                })
                .collect(),
            last_seq,
            pending,
        })
    }

    async fn push(&self, incoming: Vec<RemoteChange>) -> Result<(), RemoteError> {
        let mut docs = self.docs.lock().unwrap();
        for change in incoming {
            let current = docs.get(&change.id).and_then(|(_, doc)| doc.clone());
            if current == change.doc {
                continue;
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst) + 1;
            docs.insert(change.id, (seq, change.doc));
        }
        Ok(())
    }
}

/// In-memory server: configured listings, per-listing directories, and a
/// remote store per database URL.
#[derive(Default)]
pub struct MemServerApi {
    pub info: Mutex<HashMap<String, Listing>>,
    pub directories: Mutex<HashMap<ListingId, Vec<ProjectDoc>>>,
    pub remotes: Mutex<HashMap<String, Arc<MemRemoteStore>>>,
}

impl MemServerApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_server(&self, url: &str, listing: Listing, projects: Vec<ProjectDoc>) {
        self.directories
            .lock()
            .unwrap()
            .insert(listing.id.clone(), projects);
        self.info.lock().unwrap().insert(url.to_string(), listing);
    }

    /// The remote data store backing a database URL, if any link opened it.
    pub fn remote(&self, database_url: &str) -> Option<Arc<MemRemoteStore>> {
        self.remotes.lock().unwrap().get(database_url).cloned()
    }
}

#[async_trait]
impl ServerApi for MemServerApi {
    async fn fetch_info(&self, url: &str) -> Result<Listing, RemoteError> {
        self.info
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .ok_or_else(|| RemoteError::Network(format!("no such server: {url}")))
    }

    async fn fetch_directory(
        &self,
        listing: &Listing,
        token: Option<&str>,
    ) -> Result<Vec<ProjectDoc>, RemoteError> {
        if token.is_none() {
            return Err(RemoteError::Unauthorized);
        }
        Ok(self
            .directories
            .lock()
            .unwrap()
            .get(&listing.id)
            .cloned()
            .unwrap_or_default())
    }

    async fn fetch_project_metadata(
        &self,
        _listing: &Listing,
        project_id: &ProjectId,
        _token: Option<&str>,
    ) -> Result<Json, RemoteError> {
        Ok(json!({
            "ui-specification": { "fields": {}, "views": {} },
            "project": project_id.as_str(),
        }))
    }

    fn open_remote(&self, info: &ConnectionInfo) -> Result<Arc<dyn RemoteStore>, RemoteError> {
        let url = info
            .database_url()
            .ok_or_else(|| RemoteError::Misconfigured(info.db_name.clone()))?;
        let mut remotes = self.remotes.lock().unwrap();
        let store = remotes
            .entry(url)
            .or_insert_with(|| MemRemoteStore::new(&info.db_name))
            .clone();
        Ok(store)
    }
}

pub const SERVER_URL: &str = "https://srv.test";

pub fn listing_id() -> ListingId {
    ListingId::from("srv.test")
}

pub fn test_listing() -> Listing {
    Listing {
        id: listing_id(),
        name: "Test Server".to_string(),
        description: String::new(),
        base_url: Some(SERVER_URL.to_string()),
        projects_db: None,
        local_only: false,
        prefix: String::new(),
    }
}

pub fn test_project(id: &str) -> ProjectDoc {
    ProjectDoc {
        id: ProjectId::from(id),
        name: format!("Project {id}"),
        description: None,
        status: Some("published".to_string()),
        created: None,
        last_updated: None,
        metadata_db: None,
        data_db: Some(PossibleConnection {
            base_url: Some("https://db.srv.test".to_string()),
            db_name: Some(format!("data-{id}")),
            ..PossibleConnection::default()
        }),
    }
}

pub fn data_db_url(project: &str) -> String {
    format!("https://db.srv.test/data-{project}")
}

/// Engine wired to a one-listing, one-project in-memory server, already
/// logged in and directory-refreshed.
pub async fn engine_with_project(
    tmp: &tempfile::TempDir,
    project: &str,
) -> (Arc<SyncEngine>, Arc<MemServerApi>) {
    let api = MemServerApi::new();
    api.add_server(SERVER_URL, test_listing(), vec![test_project(project)]);

    let engine = SyncEngineBuilder::new(DataDir::new(tmp.path()))
        .with_server_url(SERVER_URL)
        .with_api(api.clone())
        .build()
        .unwrap();
    engine
        .auth()
        .set_token(&listing_id(), "alice", "tok-1")
        .unwrap();
    engine.update_directory().await.unwrap();
    (engine, api)
}

pub fn full_id(project: &str) -> FullProjectId {
    FullProjectId::resolve(&listing_id(), &ProjectId::from(project))
}

/// Record every `data_sync_state` boolean observed for one project.
pub fn record_data_sync_states(
    engine: &Arc<SyncEngine>,
    project_id: FullProjectId,
) -> Arc<Mutex<Vec<bool>>> {
    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = log.clone();
    engine.bus().subscribe(move |event| {
        if let SyncEvent::DataSyncState {
            syncing,
            project_id: id,
        } = event
        {
            if *id == project_id {
                sink.lock().unwrap().push(*syncing);
            }
        }
        Ok(())
    });
    log
}

pub async fn wait_until<F: Fn() -> bool>(what: &str, cond: F) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("timed out waiting for {what}");
}
