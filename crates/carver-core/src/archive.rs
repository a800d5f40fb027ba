//! Reconstruction of carved files from their stored chunks.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{info, warn};

use crate::backend::Backends;
use crate::compress::{is_zstd, ZSTD_SUFFIX};
use crate::model::{CarveChunk, CarveSession};
use crate::store::CarveStore;
use carver_types::error::{CarveError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveResult {
    pub path: PathBuf,
    pub size: u64,
    /// The payload is a zstd stream and the artifact carries the `.zst` suffix.
    pub compressed: bool,
}

impl ArchiveResult {
    fn at(path: PathBuf, size: u64) -> Self {
        let compressed = path.to_string_lossy().ends_with(ZSTD_SUFFIX);
        Self {
            path,
            size,
            compressed,
        }
    }
}

/// Deterministic artifact file name for a session.
pub fn archive_name(session: &CarveSession, session_id: &str) -> String {
    format!(
        "{}_{}_{}.tar",
        session.node_uuid,
        session_id,
        session.path.replace(['/', '\\'], "-")
    )
}

fn write_err(path: &Path) -> impl Fn(std::io::Error) -> CarveError + '_ {
    move |source| CarveError::Write {
        path: path.to_path_buf(),
        source,
    }
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            tracing::error!("archive lock poisoned; continuing with inner state");
            poisoned.into_inner()
        }
    }
}

pub struct Archiver {
    store: Arc<dyn CarveStore>,
    backends: Backends,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl Archiver {
    pub fn new(store: Arc<dyn CarveStore>, backends: Backends) -> Self {
        Self {
            store,
            backends,
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn session_lock(&self, session_id: &str) -> Arc<Mutex<()>> {
        lock_unpoisoned(&self.locks)
            .entry(session_id.to_string())
            .or_default()
            .clone()
    }

    fn release_lock(&self, session_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = lock_unpoisoned(&self.locks);
        // One reference in the map, one held here: nobody else is waiting.
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(session_id);
        }
    }

    /// Materialize the carve bound to `session_id` into `dest_dir`.
    ///
    /// Calls for the same session are serialised. Once a session is archived
    /// the recorded artifact is returned as long as it is still on disk; a
    /// missing artifact is rebuilt in place from the stored chunks.
    pub fn archive(&self, session_id: &str, dest_dir: &Path) -> Result<ArchiveResult> {
        let lock = self.session_lock(session_id);
        let result = {
            let _guard = lock_unpoisoned(&lock);
            self.archive_locked(session_id, dest_dir)
        };
        self.release_lock(session_id, lock);
        result
    }

    fn archive_locked(&self, session_id: &str, dest_dir: &Path) -> Result<ArchiveResult> {
        let session = self
            .store
            .session_by_id(session_id)?
            .ok_or_else(|| CarveError::NotFound(format!("session '{session_id}'")))?;

        let recorded = session.archive_path.as_deref().filter(|_| session.archived);
        if let Some(path) = recorded {
            if fs::metadata(path).is_ok() {
                return Ok(ArchiveResult::at(path.to_path_buf(), session.archive_size));
            }
            warn!(
                session_id,
                path = %path.display(),
                "archived artifact is missing, rebuilding"
            );
        }
        let dest_dir = recorded.and_then(Path::parent).unwrap_or(dest_dir);

        let plain = dest_dir.join(archive_name(&session, session_id));
        let zst = PathBuf::from(format!("{}{ZSTD_SUFFIX}", plain.display()));

        if let Some(existing) = self.adopt_existing(&session, session_id, [&plain, &zst])? {
            return Ok(existing);
        }

        let chunks = self.store.chunks(session_id)?;
        check_sequences(&session, session_id, &chunks)?;

        let pending_first = match chunks.first() {
            Some(chunk) => Some(self.backends.payload(chunk)?),
            None => None,
        };
        let compressed = pending_first.as_deref().is_some_and(is_zstd);
        let path = if compressed { zst } else { plain };

        fs::create_dir_all(dest_dir).map_err(write_err(dest_dir))?;
        let written = match self.write_artifact(&path, &chunks, pending_first) {
            Ok(written) => written,
            Err(e) => {
                // A partial file would otherwise be adopted by the next call.
                let _ = fs::remove_file(&path);
                return Err(e);
            }
        };

        self.store.mark_archived(session_id, &path, written)?;
        info!(
            session_id,
            carve_id = %session.carve_id,
            path = %path.display(),
            bytes = written,
            compressed,
            "carve archived"
        );
        Ok(ArchiveResult {
            path,
            size: written,
            compressed,
        })
    }

    fn write_artifact(
        &self,
        path: &Path,
        chunks: &[CarveChunk],
        mut pending_first: Option<Vec<u8>>,
    ) -> Result<u64> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(write_err(path))?;

        let mut written = 0u64;
        for chunk in chunks {
            let bytes = match pending_first.take() {
                Some(first) => first,
                None => self.backends.payload(chunk)?,
            };
            file.write_all(&bytes).map_err(write_err(path))?;
            written += bytes.len() as u64;
        }
        file.sync_all().map_err(write_err(path))?;
        Ok(written)
    }

    /// Reuse an artifact left by an earlier call. One whose size contradicts
    /// the declared carve size is a truncated leftover and is removed.
    fn adopt_existing(
        &self,
        session: &CarveSession,
        session_id: &str,
        candidates: [&PathBuf; 2],
    ) -> Result<Option<ArchiveResult>> {
        for candidate in candidates {
            let Ok(meta) = fs::metadata(candidate) else {
                continue;
            };
            if session.carve_size > 0 && meta.len() != session.carve_size {
                warn!(
                    session_id,
                    path = %candidate.display(),
                    found = meta.len(),
                    expected = session.carve_size,
                    "removing truncated archive"
                );
                fs::remove_file(candidate).map_err(write_err(candidate))?;
                continue;
            }
            self.store.mark_archived(session_id, candidate, meta.len())?;
            info!(session_id, path = %candidate.display(), "adopted existing archive");
            return Ok(Some(ArchiveResult::at(candidate.clone(), meta.len())));
        }
        Ok(None)
    }
}

/// Sequence numbers must be exactly `0..total_blocks`.
fn check_sequences(session: &CarveSession, session_id: &str, chunks: &[CarveChunk]) -> Result<()> {
    let in_order = chunks
        .iter()
        .enumerate()
        .all(|(i, c)| c.sequence as usize == i);
    if chunks.len() != session.total_blocks as usize || !in_order {
        return Err(CarveError::IncompleteCarve {
            session_id: session_id.to_string(),
            expected: session.total_blocks,
            found: chunks.len() as u32,
        });
    }
    Ok(())
}
