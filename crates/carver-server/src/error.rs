use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use carver_types::error::CarveError;

/// Server error type that maps to HTTP status codes.
#[derive(Debug)]
pub enum ServerError {
    NotFound(String),
    Forbidden(String),
    BadRequest(String),
    Conflict(String),
    Unavailable(String),
    Internal(String),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotFound(msg) => write!(f, "not found: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::BadRequest(msg) => write!(f, "bad request: {msg}"),
            Self::Conflict(msg) => write!(f, "conflict: {msg}"),
            Self::Unavailable(msg) => write!(f, "unavailable: {msg}"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            Self::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            Self::Forbidden(msg) => (StatusCode::FORBIDDEN, msg.clone()),
            Self::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            Self::Conflict(msg) => (StatusCode::CONFLICT, msg.clone()),
            Self::Unavailable(msg) => (StatusCode::SERVICE_UNAVAILABLE, msg.clone()),
            Self::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg.clone()),
        };
        tracing::error!(status = %status, error = %message);
        (status, message).into_response()
    }
}

impl From<CarveError> for ServerError {
    fn from(e: CarveError) -> Self {
        let message = e.to_string();
        match e {
            CarveError::NotFound(_) => Self::NotFound(message),
            CarveError::OwnershipMismatch { .. } | CarveError::EnvironmentMismatch { .. } => {
                Self::Forbidden(message)
            }
            CarveError::IncompleteCarve { .. } | CarveError::InvalidTransition { .. } => {
                Self::Conflict(message)
            }
            CarveError::BackendUnavailable(_) => Self::Unavailable(message),
            CarveError::Decoding { .. } | CarveError::SequenceOutOfRange { .. } => {
                Self::BadRequest(message)
            }
            _ => Self::Internal(message),
        }
    }
}

impl From<std::io::Error> for ServerError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(e.to_string()),
            _ => Self::Internal(e.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for ServerError {
    fn from(e: tokio::task::JoinError) -> Self {
        Self::Internal(e.to_string())
    }
}
