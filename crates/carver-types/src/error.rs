use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CarveError>;

#[derive(Debug, Error)]
pub enum CarveError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session '{session_id}' was not opened for request '{request_id}'")]
    OwnershipMismatch {
        session_id: String,
        request_id: String,
    },

    #[error("node '{node}' is not enrolled in environment '{environment}'")]
    EnvironmentMismatch { node: String, environment: String },

    #[error("storage backend '{0}' is not configured")]
    BackendUnavailable(String),

    #[error("unknown carver backend: '{0}'")]
    UnknownBackend(String),

    #[error("carve '{session_id}' is incomplete: expected {expected} chunks, found {found}")]
    IncompleteCarve {
        session_id: String,
        expected: u32,
        found: u32,
    },

    #[error("cannot decode chunk {sequence} of session '{session_id}': {reason}")]
    Decoding {
        session_id: String,
        sequence: u32,
        reason: String,
    },

    #[error("chunk {sequence} is out of range for session '{session_id}' ({total} chunks)")]
    SequenceOutOfRange {
        session_id: String,
        sequence: u32,
        total: u32,
    },

    #[error("cannot write archive '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("record store error: {0}")]
    Persistence(String),

    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error(
        "carve '{carve_id}' only partially deleted (session deleted: {session_deleted}): {reason}"
    )]
    PartialDelete {
        carve_id: String,
        session_deleted: bool,
        reason: String,
    },

    #[error("remote storage error: {0}")]
    Remote(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl CarveError {
    /// Whether the error points at data tampering rather than an operational fault.
    pub fn is_integrity_violation(&self) -> bool {
        matches!(
            self,
            CarveError::OwnershipMismatch { .. } | CarveError::EnvironmentMismatch { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_errors_are_integrity_violations() {
        let err = CarveError::OwnershipMismatch {
            session_id: "S2".into(),
            request_id: "R1".into(),
        };
        assert!(err.is_integrity_violation());
        assert!(err.to_string().contains("S2"));
        assert!(!CarveError::NotFound("x".into()).is_integrity_violation());
    }

    #[test]
    fn write_error_names_path() {
        let err = CarveError::Write {
            path: PathBuf::from("/tmp/out/a.tar"),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/out/a.tar"), "unexpected: {msg}");
        assert!(msg.contains("disk full"), "unexpected: {msg}");
    }
}
