use std::path::PathBuf;

use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use carver_core::archive::ArchiveResult;
use carver_core::model::{CarveSession, ScheduledCarve};

use crate::error::ServerError;
use crate::state::AppState;

#[derive(Debug, Deserialize, Default)]
pub struct ListQuery {
    pub request_id: Option<String>,
    pub node: Option<String>,
    pub query: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ArchiveResponse {
    pub path: PathBuf,
    pub size: u64,
    pub compressed: bool,
}

impl From<ArchiveResult> for ArchiveResponse {
    fn from(result: ArchiveResult) -> Self {
        Self {
            path: result.path,
            size: result.size,
            compressed: result.compressed,
        }
    }
}

pub async fn health() -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// POST /api/carves
pub async fn schedule_carve(
    State(state): State<AppState>,
    Json(carve): Json<ScheduledCarve>,
) -> Result<Response, ServerError> {
    if carve.carve_id.trim().is_empty() || carve.request_id.trim().is_empty() {
        return Err(ServerError::BadRequest(
            "carve_id and request_id are required".into(),
        ));
    }
    let session =
        tokio::task::spawn_blocking(move || state.inner.sessions.schedule(carve)).await??;
    Ok((StatusCode::CREATED, Json(session)).into_response())
}

/// GET /api/carves
pub async fn list_carves(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<CarveSession>>, ServerError> {
    let sessions = tokio::task::spawn_blocking(move || {
        let sessions = &state.inner.sessions;
        if let Some(request_id) = &query.request_id {
            sessions.by_request(request_id)
        } else if let Some(node) = &query.node {
            sessions.by_node(node)
        } else if let Some(name) = &query.query {
            sessions.by_query(name)
        } else {
            sessions.list()
        }
    })
    .await??;
    Ok(Json(sessions))
}

/// GET /api/carves/{carve_id}
pub async fn get_carve(
    State(state): State<AppState>,
    Path(carve_id): Path<String>,
) -> Result<Json<CarveSession>, ServerError> {
    let session =
        tokio::task::spawn_blocking(move || state.inner.sessions.get(&carve_id)).await??;
    Ok(Json(session))
}

/// POST /api/carves/{carve_id}/archive
pub async fn archive_carve(
    State(state): State<AppState>,
    Path(carve_id): Path<String>,
) -> Result<Json<ArchiveResponse>, ServerError> {
    let result = archive(state, carve_id).await?;
    Ok(Json(result.into()))
}

/// GET /api/carves/{carve_id}/download
///
/// Archives on demand; an already archived carve is served from disk as is.
pub async fn download_carve(
    State(state): State<AppState>,
    Path(carve_id): Path<String>,
) -> Result<Response, ServerError> {
    let result = archive(state, carve_id).await?;
    let file = tokio::fs::File::open(&result.path).await?;
    let file_len = file.metadata().await?.len();
    let file_name = result
        .path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();

    let body = Body::from_stream(ReaderStream::new(file));
    Ok((
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (header::CONTENT_LENGTH, file_len.to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{file_name}\""),
            ),
        ],
        body,
    )
        .into_response())
}

/// DELETE /api/carves/{carve_id}
pub async fn delete_carve(
    State(state): State<AppState>,
    Path(carve_id): Path<String>,
) -> Result<StatusCode, ServerError> {
    tokio::task::spawn_blocking(move || state.inner.sessions.delete(&carve_id)).await??;
    Ok(StatusCode::NO_CONTENT)
}

async fn archive(state: AppState, carve_id: String) -> Result<ArchiveResult, ServerError> {
    tokio::task::spawn_blocking(move || -> Result<ArchiveResult, ServerError> {
        let session = state.inner.sessions.get(&carve_id)?;
        let session_id = session.session_id.ok_or_else(|| {
            ServerError::Conflict(format!("carve '{carve_id}' has no upload session yet"))
        })?;
        let result = state
            .inner
            .archiver
            .archive(&session_id, &state.inner.carves_dir)?;
        Ok(result)
    })
    .await?
}
