use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use tracing::{debug, warn};

use crate::backend::{object_key, Backends};
use crate::model::{CarveChunk, CarverKind};
use crate::session::SessionManager;
use crate::store::InsertOutcome;
use carver_types::error::{CarveError, Result};

/// What happened to one committed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Persisted; counts towards completion.
    Stored,
    /// Same `(session, sequence)` was already stored; not counted again.
    Duplicate,
    /// The remote upload failed. Nothing was recorded and the agent may resend.
    Lost,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IngestOutcome {
    pub commit: CommitOutcome,
    pub completed_blocks: u32,
    pub complete: bool,
}

/// Turns agent uploads into stored chunks.
pub struct ChunkPipeline {
    sessions: Arc<SessionManager>,
    backends: Backends,
}

impl ChunkPipeline {
    pub fn new(sessions: Arc<SessionManager>, backends: Backends) -> Self {
        Self { sessions, backends }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn backends(&self) -> &Backends {
        &self.backends
    }

    /// Build the chunk record for one upload. Inline backends keep the base64
    /// payload verbatim; the remote backend keeps a reference to the object
    /// the payload will be uploaded to.
    #[allow(clippy::too_many_arguments)]
    pub fn build_chunk(
        &self,
        carver: CarverKind,
        environment: &str,
        node_uuid: &str,
        request_id: &str,
        session_id: &str,
        raw: &str,
        sequence: u32,
    ) -> Result<CarveChunk> {
        let size = decode_payload(raw, session_id, sequence)?.len() as u64;
        let data = match carver {
            CarverKind::Db | CarverKind::Local => raw.to_string(),
            CarverKind::S3 => match self.backends.remote() {
                Some(remote) => remote.reference(environment, node_uuid, session_id, sequence),
                // Rejected by commit_chunk before anything is stored.
                None => format!(
                    "s3:///{}",
                    object_key(environment, node_uuid, session_id, sequence)
                ),
            },
        };
        let now = Utc::now();
        Ok(CarveChunk {
            request_id: request_id.to_string(),
            session_id: session_id.to_string(),
            environment: environment.to_string(),
            sequence,
            data,
            size,
            carver,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        })
    }

    /// Persist a built chunk through its backend.
    pub fn commit_chunk(
        &self,
        chunk: &CarveChunk,
        node_uuid: &str,
        raw: &str,
    ) -> Result<CommitOutcome> {
        if chunk.carver == CarverKind::S3 {
            let remote = self.backends.require_remote()?;
            let bytes = decode_payload(raw, &chunk.session_id, chunk.sequence)?;
            let key = object_key(&chunk.environment, node_uuid, &chunk.session_id, chunk.sequence);
            if let Err(e) = remote.storage().put_owned(&key, bytes) {
                warn!(
                    session_id = %chunk.session_id,
                    sequence = chunk.sequence,
                    bucket = remote.bucket(),
                    "chunk upload failed, chunk lost: {e}"
                );
                return Ok(CommitOutcome::Lost);
            }
        }

        let outcome = match self.sessions.store().insert_chunk(chunk)? {
            InsertOutcome::Inserted => CommitOutcome::Stored,
            InsertOutcome::Duplicate => CommitOutcome::Duplicate,
        };
        debug!(
            session_id = %chunk.session_id,
            sequence = chunk.sequence,
            size = chunk.size,
            carver = %chunk.carver,
            ?outcome,
            "chunk committed"
        );
        Ok(outcome)
    }

    /// Full path of one agent upload: ownership, environment, build, commit,
    /// completion accounting.
    pub fn ingest(
        &self,
        environment: &str,
        request_id: &str,
        session_id: &str,
        sequence: u32,
        raw: &str,
    ) -> Result<IngestOutcome> {
        let session = self.sessions.check_ownership(session_id, request_id)?;
        if session.environment != environment {
            return Err(CarveError::EnvironmentMismatch {
                node: session.node_uuid,
                environment: environment.to_string(),
            });
        }
        if sequence >= session.total_blocks {
            return Err(CarveError::SequenceOutOfRange {
                session_id: session_id.to_string(),
                sequence,
                total: session.total_blocks,
            });
        }

        let chunk = self.build_chunk(
            session.carver,
            environment,
            &session.node_uuid,
            &session.request_id,
            session_id,
            raw,
            sequence,
        )?;
        let commit = self.commit_chunk(&chunk, &session.node_uuid, raw)?;
        if commit != CommitOutcome::Stored {
            return Ok(IngestOutcome {
                commit,
                completed_blocks: session.completed_blocks,
                complete: session.is_complete(),
            });
        }

        let completed_blocks = self.sessions.mark_chunk_complete(session_id)?;
        let complete = self.sessions.complete_if_done(session_id)?;
        Ok(IngestOutcome {
            commit,
            completed_blocks,
            complete,
        })
    }
}

fn decode_payload(raw: &str, session_id: &str, sequence: u32) -> Result<Vec<u8>> {
    STANDARD
        .decode(raw.trim())
        .map_err(|e| CarveError::Decoding {
            session_id: session_id.to_string(),
            sequence,
            reason: e.to_string(),
        })
}
