use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};

use crate::archive::Archiver;
use crate::backend::{Backends, RemoteStore};
use crate::ingest::ChunkPipeline;
use crate::model::{
    CarveChunk, CarveSession, CarveStatus, CarverKind, ScheduledCarve, SessionBinding,
    SessionFilter,
};
use crate::registry::StaticRegistry;
use crate::session::SessionManager;
use crate::store::{CarveStore, InsertOutcome, MemoryStore};
use carver_storage::StorageBackend;
use carver_types::error::{CarveError, Result};

pub const NODE: &str = "node-a";
pub const ENV: &str = "prod";
pub const BUCKET: &str = "carves";

/// In-memory object store for testing. Thread-safe via Mutex.
#[derive(Default)]
pub struct MemoryBackend {
    data: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.lock().unwrap().keys().cloned().collect();
        keys.sort();
        keys
    }
}

impl StorageBackend for MemoryBackend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.data.lock().unwrap().get(key).cloned())
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.data
            .lock()
            .unwrap()
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }
}

/// Object store whose uploads always fail.
pub struct FailingBackend;

impl StorageBackend for FailingBackend {
    fn get(&self, _key: &str) -> Result<Option<Vec<u8>>> {
        Ok(None)
    }

    fn put(&self, key: &str, _data: &[u8]) -> Result<()> {
        Err(CarveError::Remote(format!("S3 PUT {key}: connection refused")))
    }
}

/// Record store that can be told to fail chunk deletion.
#[derive(Default)]
pub struct BrittleStore {
    inner: MemoryStore,
    pub fail_chunk_delete: AtomicBool,
}

impl CarveStore for BrittleStore {
    fn insert_session(&self, session: &CarveSession) -> Result<()> {
        self.inner.insert_session(session)
    }

    fn sessions(&self, filter: &SessionFilter) -> Result<Vec<CarveSession>> {
        self.inner.sessions(filter)
    }

    fn bind_pending(
        &self,
        request_id: &str,
        binding: &SessionBinding,
    ) -> Result<Vec<CarveSession>> {
        self.inner.bind_pending(request_id, binding)
    }

    fn increment_completed(&self, session_id: &str) -> Result<u32> {
        self.inner.increment_completed(session_id)
    }

    fn set_status(
        &self,
        session_id: &str,
        status: CarveStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        self.inner.set_status(session_id, status, completed_at)
    }

    fn mark_archived(&self, session_id: &str, path: &Path, size: u64) -> Result<()> {
        self.inner.mark_archived(session_id, path, size)
    }

    fn soft_delete_session(&self, carve_id: &str) -> Result<bool> {
        self.inner.soft_delete_session(carve_id)
    }

    fn delete_session(&self, carve_id: &str) -> Result<bool> {
        self.inner.delete_session(carve_id)
    }

    fn insert_chunk(&self, chunk: &CarveChunk) -> Result<InsertOutcome> {
        self.inner.insert_chunk(chunk)
    }

    fn chunks(&self, session_id: &str) -> Result<Vec<CarveChunk>> {
        self.inner.chunks(session_id)
    }

    fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        if self.fail_chunk_delete.load(Ordering::SeqCst) {
            return Err(CarveError::Persistence("disk I/O error".into()));
        }
        self.inner.delete_chunks(session_id)
    }
}

pub fn b64(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn registry() -> Arc<StaticRegistry> {
    let mut registry = StaticRegistry::default();
    registry.insert(NODE, ENV);
    registry.insert("node-b", ENV);
    registry.insert("node-dev", "dev");
    Arc::new(registry)
}

pub fn scheduled(carve_id: &str, request_id: &str, path: &str) -> ScheduledCarve {
    ScheduledCarve {
        carve_id: carve_id.to_string(),
        request_id: request_id.to_string(),
        node_uuid: NODE.to_string(),
        environment: ENV.to_string(),
        query_name: format!("carve_{carve_id}"),
        path: path.to_string(),
    }
}

pub fn chunk_with(carver: CarverKind, sequence: u32, data: &str) -> CarveChunk {
    let now = Utc::now();
    CarveChunk {
        request_id: "R1".into(),
        session_id: "sess".into(),
        environment: ENV.into(),
        sequence,
        data: data.to_string(),
        size: 0,
        carver,
        created_at: now,
        updated_at: now,
        deleted_at: None,
    }
}

/// Session manager, pipeline and archiver wired over one store.
pub struct Harness {
    pub store: Arc<dyn CarveStore>,
    pub sessions: Arc<SessionManager>,
    pub pipeline: ChunkPipeline,
    pub archiver: Archiver,
}

impl Harness {
    pub fn inline(kind: CarverKind) -> Self {
        Self::build(Arc::new(MemoryStore::new()), Backends::inline(kind))
    }

    pub fn remote(storage: Arc<dyn StorageBackend>) -> Self {
        let remote = RemoteStore::new(BUCKET, storage);
        Self::build(
            Arc::new(MemoryStore::new()),
            Backends::new(CarverKind::S3, Some(remote)),
        )
    }

    pub fn build(store: Arc<dyn CarveStore>, backends: Backends) -> Self {
        let sessions = Arc::new(SessionManager::new(
            store.clone(),
            registry(),
            backends.kind(),
        ));
        Self {
            pipeline: ChunkPipeline::new(sessions.clone(), backends.clone()),
            archiver: Archiver::new(store.clone(), backends),
            store,
            sessions,
        }
    }

    /// Schedule a carve for `request_id` and open an upload of `blocks` chunks.
    pub fn open(&self, carve_id: &str, request_id: &str, session_id: &str, blocks: u32) {
        self.sessions
            .schedule(scheduled(carve_id, request_id, "/etc/hosts"))
            .unwrap();
        self.sessions
            .initialize(request_id, 0, blocks, 10, session_id)
            .unwrap();
    }
}
