use std::path::PathBuf;
use std::sync::Arc;

use tracing::{info, warn};

use carver_core::archive::Archiver;
use carver_core::backend::Backends;
use carver_core::config::CarverConfig;
use carver_core::ingest::ChunkPipeline;
use carver_core::registry::StaticRegistry;
use carver_core::session::SessionManager;
use carver_core::store::{CarveStore, MemoryStore, SqliteStore};
use carver_types::error::Result;

/// Shared application state, wrapped in Arc for axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub inner: Arc<AppStateInner>,
}

pub struct AppStateInner {
    pub sessions: Arc<SessionManager>,
    pub pipeline: ChunkPipeline,
    pub archiver: Archiver,
    /// Directory finished carves are reassembled into.
    pub carves_dir: PathBuf,
}

impl AppState {
    pub fn new(pipeline: ChunkPipeline, archiver: Archiver, carves_dir: PathBuf) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                sessions: pipeline.sessions().clone(),
                pipeline,
                archiver,
                carves_dir,
            }),
        }
    }

    /// Wire the record store, registry and backends described by `config`.
    pub fn from_config(config: &CarverConfig) -> Result<Self> {
        let kind = config.carver_kind()?;
        let store: Arc<dyn CarveStore> = match &config.database.path {
            Some(path) => {
                info!(path = %path.display(), "using sqlite record store");
                Arc::new(SqliteStore::open(path)?)
            }
            None => {
                info!("no database configured, records are kept in memory");
                Arc::new(MemoryStore::new())
            }
        };
        let registry = Arc::new(StaticRegistry::new(config.nodes.clone()));
        if registry.is_empty() {
            warn!("no nodes enrolled, every carve will be refused");
        } else {
            info!(nodes = registry.len(), "node registry loaded");
        }
        let backends = Backends::from_config(kind, &config.s3.storage_config())?;

        let sessions = Arc::new(SessionManager::new(store.clone(), registry, kind));
        let pipeline = ChunkPipeline::new(sessions, backends.clone());
        let archiver = Archiver::new(store, backends);
        Ok(Self::new(pipeline, archiver, config.carves_dir.clone()))
    }
}
