use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::model::{
    CarveSession, CarveStatus, CarverKind, ScheduledCarve, SessionBinding, SessionFilter,
};
use crate::registry::NodeRegistry;
use crate::store::CarveStore;
use carver_types::error::{CarveError, Result};

/// Fresh agent-facing session identifier: 128 random bits as 32 hex chars.
pub fn generate_session_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Owns the lifecycle of carve sessions, from scheduling to completion.
pub struct SessionManager {
    store: Arc<dyn CarveStore>,
    registry: Arc<dyn NodeRegistry>,
    carver: CarverKind,
}

impl SessionManager {
    /// `carver` is the deployment's backend; it is stamped onto every
    /// session when the agent opens its upload.
    pub fn new(
        store: Arc<dyn CarveStore>,
        registry: Arc<dyn NodeRegistry>,
        carver: CarverKind,
    ) -> Self {
        Self {
            store,
            registry,
            carver,
        }
    }

    pub fn store(&self) -> &Arc<dyn CarveStore> {
        &self.store
    }

    pub fn registry(&self) -> &Arc<dyn NodeRegistry> {
        &self.registry
    }

    pub fn carver(&self) -> CarverKind {
        self.carver
    }

    /// Record a carve that has been requested but not yet acknowledged.
    pub fn create(&self, carve: ScheduledCarve) -> Result<CarveSession> {
        self.insert(carve, CarveStatus::Queried)
    }

    /// Record a carve the endpoint acknowledged. The endpoint must be
    /// enrolled in the environment the carve claims.
    pub fn schedule(&self, carve: ScheduledCarve) -> Result<CarveSession> {
        self.registry.verify_environment(&carve.node_uuid, &carve.environment)?;
        self.insert(carve, CarveStatus::Scheduled)
    }

    fn insert(&self, carve: ScheduledCarve, status: CarveStatus) -> Result<CarveSession> {
        let session = CarveSession::new(carve, status, self.carver);
        self.store.insert_session(&session)?;
        info!(
            carve_id = %session.carve_id,
            request_id = %session.request_id,
            node = %session.node_uuid,
            %status,
            "carve created"
        );
        Ok(session)
    }

    /// Bind an agent upload to every pending session of `request_id`.
    ///
    /// Sessions that are already bound keep their session id. Fails with
    /// `NotFound` if the request has no pending session.
    pub fn initialize(
        &self,
        request_id: &str,
        carve_size: u64,
        block_count: u32,
        block_size: u64,
        session_id: &str,
    ) -> Result<Vec<CarveSession>> {
        let binding = SessionBinding {
            session_id: session_id.to_string(),
            carve_size,
            block_size,
            total_blocks: block_count,
            carver: self.carver,
        };
        let bound = self.store.bind_pending(request_id.trim(), &binding)?;
        if bound.is_empty() {
            return Err(CarveError::NotFound(format!(
                "pending carve for request '{request_id}'"
            )));
        }
        info!(
            request_id,
            session_id,
            sessions = bound.len(),
            blocks = block_count,
            carver = %self.carver,
            "carve session opened"
        );
        Ok(bound)
    }

    /// Generate a session id and bind it to the pending sessions of `request_id`.
    pub fn open_session(
        &self,
        request_id: &str,
        carve_size: u64,
        block_count: u32,
        block_size: u64,
    ) -> Result<String> {
        let session_id = generate_session_id();
        self.initialize(request_id, carve_size, block_count, block_size, &session_id)?;
        Ok(session_id)
    }

    pub fn get(&self, carve_id: &str) -> Result<CarveSession> {
        self.store
            .session_by_carve(carve_id)?
            .ok_or_else(|| CarveError::NotFound(format!("carve '{carve_id}'")))
    }

    pub fn by_session(&self, session_id: &str) -> Result<CarveSession> {
        self.store
            .session_by_id(session_id)?
            .ok_or_else(|| CarveError::NotFound(format!("session '{session_id}'")))
    }

    pub fn by_request(&self, request_id: &str) -> Result<Vec<CarveSession>> {
        self.store.sessions(&SessionFilter::request(request_id))
    }

    pub fn by_node(&self, node_uuid: &str) -> Result<Vec<CarveSession>> {
        self.store.sessions(&SessionFilter::node(node_uuid))
    }

    pub fn by_query(&self, query_name: &str) -> Result<Vec<CarveSession>> {
        self.store.sessions(&SessionFilter::query(query_name))
    }

    pub fn list(&self) -> Result<Vec<CarveSession>> {
        self.store.sessions(&SessionFilter::default())
    }

    /// Whether `session_id` was opened for `request_id`. Unknown sessions are
    /// never owned.
    pub fn verify_session_ownership(&self, session_id: &str, request_id: &str) -> Result<bool> {
        Ok(self
            .store
            .session_by_id(session_id)?
            .is_some_and(|s| s.request_id == request_id.trim()))
    }

    /// The session bound to `session_id`, provided it belongs to `request_id`.
    pub fn check_ownership(&self, session_id: &str, request_id: &str) -> Result<CarveSession> {
        let session = self.by_session(session_id)?;
        if session.request_id != request_id.trim() {
            return Err(CarveError::OwnershipMismatch {
                session_id: session_id.to_string(),
                request_id: request_id.to_string(),
            });
        }
        Ok(session)
    }

    /// Count one more stored chunk. Returns the new completed count.
    pub fn mark_chunk_complete(&self, session_id: &str) -> Result<u32> {
        let completed = self.store.increment_completed(session_id)?;
        debug!(session_id, completed, "chunk completed");
        Ok(completed)
    }

    /// Move a session forward in its lifecycle. Moving backwards fails with
    /// `InvalidTransition`; re-applying the current status is a no-op.
    pub fn set_status(&self, session_id: &str, status: CarveStatus) -> Result<()> {
        let current = self.by_session(session_id)?.status;
        if status < current {
            return Err(CarveError::InvalidTransition {
                from: current.to_string(),
                to: status.to_string(),
            });
        }
        if status == current {
            return Ok(());
        }
        let completed_at = (status == CarveStatus::Completed).then(Utc::now);
        self.store.set_status(session_id, status, completed_at)?;
        info!(session_id, from = %current, to = %status, "carve status changed");
        Ok(())
    }

    pub fn is_complete(&self, session_id: &str) -> Result<bool> {
        Ok(self.by_session(session_id)?.is_complete())
    }

    /// Flip the session to `COMPLETED` once every chunk is accounted for.
    /// Returns whether the session is complete.
    pub fn complete_if_done(&self, session_id: &str) -> Result<bool> {
        let session = self.by_session(session_id)?;
        if !session.is_complete() {
            return Ok(false);
        }
        if session.status != CarveStatus::Completed {
            self.set_status(session_id, CarveStatus::Completed)?;
        }
        Ok(true)
    }

    /// Flag a session and its chunks as deleted without erasing them.
    pub fn soft_delete(&self, carve_id: &str) -> Result<()> {
        if !self.store.soft_delete_session(carve_id)? {
            return Err(CarveError::NotFound(format!("carve '{carve_id}'")));
        }
        info!(carve_id, "carve soft-deleted");
        Ok(())
    }

    /// Erase a session, then its chunks. When the session row is gone but
    /// chunk removal fails, `PartialDelete` tells the caller to retry
    /// `delete_chunks` for the remainder.
    pub fn delete(&self, carve_id: &str) -> Result<()> {
        let session = self
            .store
            .sessions(&SessionFilter::carve(carve_id).with_deleted())?
            .into_iter()
            .next()
            .ok_or_else(|| CarveError::NotFound(format!("carve '{carve_id}'")))?;

        if !self.store.delete_session(carve_id)? {
            return Err(CarveError::NotFound(format!("carve '{carve_id}'")));
        }

        let Some(session_id) = session.session_id else {
            info!(carve_id, "carve deleted");
            return Ok(());
        };
        // Sessions sharing a fanned-out upload keep its chunks alive.
        let still_bound = !self
            .store
            .sessions(&SessionFilter::session(&session_id).with_deleted())?
            .is_empty();
        if still_bound {
            info!(carve_id, %session_id, "carve deleted, chunks kept for sibling carves");
            return Ok(());
        }
        match self.store.delete_chunks(&session_id) {
            Ok(removed) => {
                info!(carve_id, %session_id, chunks = removed, "carve deleted");
                Ok(())
            }
            Err(e) => Err(CarveError::PartialDelete {
                carve_id: carve_id.to_string(),
                session_deleted: true,
                reason: e.to_string(),
            }),
        }
    }

    pub fn delete_chunks(&self, session_id: &str) -> Result<usize> {
        self.store.delete_chunks(session_id)
    }
}
