use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::{CarveStore, InsertOutcome};
use crate::model::{CarveChunk, CarveSession, CarveStatus, SessionBinding, SessionFilter};
use carver_types::error::{CarveError, Result};

#[derive(Default)]
struct Tables {
    sessions: HashMap<String, CarveSession>,
    chunks: BTreeMap<(String, u32), CarveChunk>,
}

/// Record store kept entirely in memory. A single mutex serialises writers,
/// which makes every update atomic.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        match self.tables.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("memory store mutex poisoned; continuing with inner state");
                poisoned.into_inner()
            }
        }
    }
}

fn bound_to<'a>(
    tables: &'a mut Tables,
    session_id: &'a str,
) -> impl Iterator<Item = &'a mut CarveSession> + 'a {
    tables
        .sessions
        .values_mut()
        .filter(move |s| !s.is_deleted() && s.session_id.as_deref() == Some(session_id))
}

impl CarveStore for MemoryStore {
    fn insert_session(&self, session: &CarveSession) -> Result<()> {
        let mut tables = self.lock();
        if tables.sessions.contains_key(&session.carve_id) {
            return Err(CarveError::Persistence(format!(
                "carve '{}' already exists",
                session.carve_id
            )));
        }
        tables
            .sessions
            .insert(session.carve_id.clone(), session.clone());
        Ok(())
    }

    fn sessions(&self, filter: &SessionFilter) -> Result<Vec<CarveSession>> {
        let tables = self.lock();
        let mut found: Vec<CarveSession> = tables
            .sessions
            .values()
            .filter(|s| filter.matches(s))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.carve_id.cmp(&b.carve_id))
        });
        Ok(found)
    }

    fn bind_pending(
        &self,
        request_id: &str,
        binding: &SessionBinding,
    ) -> Result<Vec<CarveSession>> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut bound: Vec<CarveSession> = tables
            .sessions
            .values_mut()
            .filter(|s| !s.is_deleted() && s.request_id == request_id && s.status.is_pending())
            .map(|session| {
                session.session_id = Some(binding.session_id.clone());
                session.carve_size = binding.carve_size;
                session.block_size = binding.block_size;
                session.total_blocks = binding.total_blocks;
                session.carver = binding.carver;
                session.status = CarveStatus::InProgress;
                session.updated_at = now;
                session.clone()
            })
            .collect();
        bound.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.carve_id.cmp(&b.carve_id))
        });
        Ok(bound)
    }

    fn increment_completed(&self, session_id: &str) -> Result<u32> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut count = None;
        for session in bound_to(&mut tables, session_id) {
            if session.completed_blocks < session.total_blocks {
                session.completed_blocks += 1;
                session.updated_at = now;
            }
            count = Some(count.unwrap_or(0).max(session.completed_blocks));
        }
        count.ok_or_else(|| CarveError::NotFound(format!("session '{session_id}'")))
    }

    fn set_status(
        &self,
        session_id: &str,
        status: CarveStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut touched = false;
        for session in bound_to(&mut tables, session_id) {
            session.status = status;
            if completed_at.is_some() {
                session.completed_at = completed_at;
            }
            session.updated_at = now;
            touched = true;
        }
        if !touched {
            return Err(CarveError::NotFound(format!("session '{session_id}'")));
        }
        Ok(())
    }

    fn mark_archived(&self, session_id: &str, path: &Path, size: u64) -> Result<()> {
        let mut tables = self.lock();
        let now = Utc::now();
        let mut found = false;
        for session in bound_to(&mut tables, session_id) {
            found = true;
            if session.archived {
                if session.archive_path.as_deref() != Some(path) {
                    return Err(CarveError::Persistence(format!(
                        "session '{session_id}' is already archived elsewhere"
                    )));
                }
                continue;
            }
            session.archived = true;
            session.archive_path = Some(path.to_path_buf());
            session.archive_size = size;
            session.updated_at = now;
        }
        if !found {
            return Err(CarveError::NotFound(format!("session '{session_id}'")));
        }
        Ok(())
    }

    fn soft_delete_session(&self, carve_id: &str) -> Result<bool> {
        let mut tables = self.lock();
        let now = Utc::now();
        let Some(session) = tables
            .sessions
            .get_mut(carve_id)
            .filter(|s| !s.is_deleted())
        else {
            return Ok(false);
        };
        session.deleted_at = Some(now);
        session.updated_at = now;
        let Some(session_id) = session.session_id.clone() else {
            return Ok(true);
        };
        let shared = tables
            .sessions
            .values()
            .any(|s| !s.is_deleted() && s.session_id.as_deref() == Some(session_id.as_str()));
        if shared {
            return Ok(true);
        }
        for chunk in tables
            .chunks
            .range_mut((session_id.clone(), 0)..=(session_id, u32::MAX))
            .map(|(_, c)| c)
        {
            chunk.deleted_at = Some(now);
            chunk.updated_at = now;
        }
        Ok(true)
    }

    fn delete_session(&self, carve_id: &str) -> Result<bool> {
        Ok(self.lock().sessions.remove(carve_id).is_some())
    }

    fn insert_chunk(&self, chunk: &CarveChunk) -> Result<InsertOutcome> {
        let mut tables = self.lock();
        let key = (chunk.session_id.clone(), chunk.sequence);
        if tables.chunks.contains_key(&key) {
            return Ok(InsertOutcome::Duplicate);
        }
        tables.chunks.insert(key, chunk.clone());
        Ok(InsertOutcome::Inserted)
    }

    fn chunks(&self, session_id: &str) -> Result<Vec<CarveChunk>> {
        let tables = self.lock();
        Ok(tables
            .chunks
            .range((session_id.to_string(), 0)..=(session_id.to_string(), u32::MAX))
            .map(|(_, c)| c)
            .filter(|c| c.deleted_at.is_none())
            .cloned()
            .collect())
    }

    fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        let mut tables = self.lock();
        let before = tables.chunks.len();
        tables.chunks.retain(|(sid, _), _| sid != session_id);
        Ok(before - tables.chunks.len())
    }
}
