//! Persisted record sets for carve sessions and their chunks.
//!
//! Sessions are keyed by carve id and looked up by session id; chunks are
//! keyed by `(session id, sequence)`. Every read path skips soft-deleted
//! records unless the caller explicitly asks for them.

pub mod memory;
pub mod sqlite;

use std::path::Path;

use chrono::{DateTime, Utc};

use crate::model::{CarveChunk, CarveSession, CarveStatus, SessionBinding, SessionFilter};
use carver_types::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Result of inserting a chunk row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// A chunk with the same `(session, sequence)` already exists; nothing changed.
    Duplicate,
}

pub trait CarveStore: Send + Sync {
    /// Insert a new session. Fails if the carve id already exists.
    fn insert_session(&self, session: &CarveSession) -> Result<()>;

    /// All sessions matching `filter`, oldest first.
    fn sessions(&self, filter: &SessionFilter) -> Result<Vec<CarveSession>>;

    /// Bind an agent upload to every live session of `request_id` that is
    /// still `QUERIED` or `SCHEDULED`: store the declared sizing, session id
    /// and backend, and move them to `IN PROGRESS`. Selection and update are
    /// one atomic step, so of two racing binds only one finds pending
    /// sessions. Returns the sessions bound by this call, oldest first.
    fn bind_pending(
        &self,
        request_id: &str,
        binding: &SessionBinding,
    ) -> Result<Vec<CarveSession>>;

    /// Atomically add one completed chunk to every session bound to
    /// `session_id`, never exceeding its total. Returns the new count.
    fn increment_completed(&self, session_id: &str) -> Result<u32>;

    fn set_status(
        &self,
        session_id: &str,
        status: CarveStatus,
        completed_at: Option<DateTime<Utc>>,
    ) -> Result<()>;

    /// Record the archive artifact. Fails if the session already points at a
    /// different artifact.
    fn mark_archived(&self, session_id: &str, path: &Path, size: u64) -> Result<()>;

    /// Flag a session as deleted, and its chunks too unless another live
    /// session is still bound to the same session id. Returns false if no
    /// live session matched.
    fn soft_delete_session(&self, carve_id: &str) -> Result<bool>;

    /// Physically remove a session row. Returns false if it did not exist.
    fn delete_session(&self, carve_id: &str) -> Result<bool>;

    fn insert_chunk(&self, chunk: &CarveChunk) -> Result<InsertOutcome>;

    /// Live chunks of a session ordered by ascending sequence number.
    fn chunks(&self, session_id: &str) -> Result<Vec<CarveChunk>>;

    /// Physically remove all chunks of a session. Returns how many were removed.
    fn delete_chunks(&self, session_id: &str) -> Result<usize>;

    /// First live session bound to `session_id`.
    fn session_by_id(&self, session_id: &str) -> Result<Option<CarveSession>> {
        Ok(self
            .sessions(&SessionFilter::session(session_id))?
            .into_iter()
            .next())
    }

    /// Live session for `carve_id`.
    fn session_by_carve(&self, carve_id: &str) -> Result<Option<CarveSession>> {
        Ok(self
            .sessions(&SessionFilter::carve(carve_id))?
            .into_iter()
            .next())
    }
}
