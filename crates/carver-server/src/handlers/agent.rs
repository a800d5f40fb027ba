use axum::extract::{Path, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use carver_core::ingest::CommitOutcome;
use carver_types::error::CarveError;

use crate::error::ServerError;
use crate::state::AppState;

/// Sent by an endpoint to open an upload for a scheduled carve.
#[derive(Debug, Deserialize)]
pub struct CarveInitRequest {
    pub block_count: u32,
    pub block_size: u64,
    pub carve_size: u64,
    /// Agent-side identifier of the carve; informational only.
    #[serde(default)]
    pub carve_id: String,
    pub request_id: String,
    pub node_key: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CarveInitResponse {
    pub success: bool,
    pub session_id: String,
}

/// One chunk of an open upload.
#[derive(Debug, Deserialize)]
pub struct CarveBlockRequest {
    pub block_id: u32,
    pub session_id: String,
    pub request_id: String,
    pub data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CarveBlockResponse {
    pub success: bool,
}

/// POST /{env}/carve_init
///
/// The session id must exist in the store before the response goes out,
/// otherwise the first block would race the binding.
pub async fn carve_init(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Json(req): Json<CarveInitRequest>,
) -> Result<Json<CarveInitResponse>, ServerError> {
    if req.node_key.trim().is_empty() {
        warn!(env = %env, request_id = %req.request_id, "carve init without node key");
        return Ok(Json(CarveInitResponse {
            success: false,
            session_id: String::new(),
        }));
    }

    debug!(
        env = %env,
        request_id = %req.request_id,
        agent_carve_id = %req.carve_id,
        blocks = req.block_count,
        "carve init"
    );
    let request_id = req.request_id.clone();
    let opened = tokio::task::spawn_blocking(move || {
        state.inner.sessions.open_session(
            &req.request_id,
            req.carve_size,
            req.block_count,
            req.block_size,
        )
    })
    .await?;

    match opened {
        Ok(session_id) => Ok(Json(CarveInitResponse {
            success: true,
            session_id,
        })),
        Err(e) => {
            warn!(env = %env, request_id = %request_id, error = %e, "carve init rejected");
            Ok(Json(CarveInitResponse {
                success: false,
                session_id: String::new(),
            }))
        }
    }
}

/// POST /{env}/carve_block
pub async fn carve_block(
    State(state): State<AppState>,
    Path(env): Path<String>,
    Json(req): Json<CarveBlockRequest>,
) -> Result<Json<CarveBlockResponse>, ServerError> {
    let session_id = req.session_id.clone();
    let block_id = req.block_id;
    let env_for_ingest = env.clone();
    let ingested = tokio::task::spawn_blocking(move || {
        state.inner.pipeline.ingest(
            &env_for_ingest,
            &req.request_id,
            &req.session_id,
            req.block_id,
            &req.data,
        )
    })
    .await?;

    match ingested {
        Ok(outcome) => {
            debug!(
                env = %env,
                session_id = %session_id,
                block_id,
                completed = outcome.completed_blocks,
                complete = outcome.complete,
                "carve block handled"
            );
            Ok(Json(CarveBlockResponse {
                success: outcome.commit != CommitOutcome::Lost,
            }))
        }
        Err(e) if is_rejection(&e) => {
            warn!(
                env = %env,
                session_id = %session_id,
                block_id,
                error = %e,
                "carve block rejected"
            );
            Ok(Json(CarveBlockResponse { success: false }))
        }
        Err(e) => Err(e.into()),
    }
}

/// Errors caused by the upload itself rather than by the server.
fn is_rejection(e: &CarveError) -> bool {
    e.is_integrity_violation()
        || matches!(
            e,
            CarveError::NotFound(_)
                | CarveError::Decoding { .. }
                | CarveError::SequenceOutOfRange { .. }
        )
}
