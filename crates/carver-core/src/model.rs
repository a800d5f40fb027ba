use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use carver_types::error::CarveError;

/// Lifecycle of a carve. Variants are declared in transition order, so the
/// derived `Ord` doubles as the monotonicity check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum CarveStatus {
    #[serde(rename = "QUERIED")]
    Queried,
    #[serde(rename = "SCHEDULED")]
    Scheduled,
    #[serde(rename = "IN PROGRESS")]
    InProgress,
    #[serde(rename = "COMPLETED")]
    Completed,
}

impl CarveStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarveStatus::Queried => "QUERIED",
            CarveStatus::Scheduled => "SCHEDULED",
            CarveStatus::InProgress => "IN PROGRESS",
            CarveStatus::Completed => "COMPLETED",
        }
    }

    /// Sessions in these states have not been bound to an agent upload yet.
    pub fn is_pending(&self) -> bool {
        matches!(self, CarveStatus::Queried | CarveStatus::Scheduled)
    }
}

impl fmt::Display for CarveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CarveStatus {
    type Err = CarveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUERIED" => Ok(CarveStatus::Queried),
            "SCHEDULED" => Ok(CarveStatus::Scheduled),
            "IN PROGRESS" => Ok(CarveStatus::InProgress),
            "COMPLETED" => Ok(CarveStatus::Completed),
            other => Err(CarveError::Persistence(format!("unknown carve status '{other}'"))),
        }
    }
}

/// Where chunk payloads of a session live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CarverKind {
    /// Payload stored inline in the record store.
    #[default]
    Db,
    /// Stored inline like `Db`, materialized on local disk when archived.
    Local,
    /// Payload pushed to the remote object store; the record keeps a reference.
    S3,
}

impl CarverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CarverKind::Db => "db",
            CarverKind::Local => "local",
            CarverKind::S3 => "s3",
        }
    }

    pub fn is_inline(&self) -> bool {
        !matches!(self, CarverKind::S3)
    }
}

impl fmt::Display for CarverKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CarverKind {
    type Err = CarveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "db" => Ok(CarverKind::Db),
            "local" => Ok(CarverKind::Local),
            "s3" => Ok(CarverKind::S3),
            _ => Err(CarveError::UnknownBackend(s.to_string())),
        }
    }
}

/// Operator-side description of a carve acknowledged by an endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledCarve {
    pub carve_id: String,
    pub request_id: String,
    pub node_uuid: String,
    pub environment: String,
    pub query_name: String,
    pub path: String,
}

/// One logical file carve request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarveSession {
    pub carve_id: String,
    pub request_id: String,
    /// Agent-facing identifier, bound when the agent opens the upload.
    pub session_id: Option<String>,
    pub node_uuid: String,
    pub environment: String,
    pub query_name: String,
    pub path: String,
    pub carve_size: u64,
    pub block_size: u64,
    pub total_blocks: u32,
    pub completed_blocks: u32,
    pub status: CarveStatus,
    pub carver: CarverKind,
    pub archived: bool,
    pub archive_path: Option<PathBuf>,
    pub archive_size: u64,
    pub completed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl CarveSession {
    pub fn new(carve: ScheduledCarve, status: CarveStatus, carver: CarverKind) -> Self {
        let now = Utc::now();
        Self {
            carve_id: carve.carve_id,
            request_id: carve.request_id,
            session_id: None,
            node_uuid: carve.node_uuid,
            environment: carve.environment,
            query_name: carve.query_name,
            path: carve.path,
            carve_size: 0,
            block_size: 0,
            total_blocks: 0,
            completed_blocks: 0,
            status,
            carver,
            archived: false,
            archive_path: None,
            archive_size: 0,
            completed_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    pub fn is_complete(&self) -> bool {
        self.total_blocks == self.completed_blocks
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

/// Sizing an agent declares when it opens an upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionBinding {
    pub session_id: String,
    pub carve_size: u64,
    pub block_size: u64,
    pub total_blocks: u32,
    pub carver: CarverKind,
}

/// One uploaded piece of a carve. Never mutated once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarveChunk {
    pub request_id: String,
    pub session_id: String,
    pub environment: String,
    pub sequence: u32,
    /// Base64 payload for inline backends, object reference for the remote one.
    pub data: String,
    /// Decoded payload size in bytes.
    pub size: u64,
    pub carver: CarverKind,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Selection of sessions. Unset fields match everything; soft-deleted
/// sessions are skipped unless `include_deleted` is set.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub carve_id: Option<String>,
    pub request_id: Option<String>,
    pub session_id: Option<String>,
    pub node_uuid: Option<String>,
    pub query_name: Option<String>,
    pub include_deleted: bool,
}

impl SessionFilter {
    pub fn carve(carve_id: &str) -> Self {
        Self {
            carve_id: Some(carve_id.to_string()),
            ..Default::default()
        }
    }

    pub fn request(request_id: &str) -> Self {
        Self {
            request_id: Some(request_id.to_string()),
            ..Default::default()
        }
    }

    pub fn session(session_id: &str) -> Self {
        Self {
            session_id: Some(session_id.to_string()),
            ..Default::default()
        }
    }

    pub fn node(node_uuid: &str) -> Self {
        Self {
            node_uuid: Some(node_uuid.to_string()),
            ..Default::default()
        }
    }

    pub fn query(query_name: &str) -> Self {
        Self {
            query_name: Some(query_name.to_string()),
            ..Default::default()
        }
    }

    pub fn with_deleted(mut self) -> Self {
        self.include_deleted = true;
        self
    }

    pub fn matches(&self, session: &CarveSession) -> bool {
        fn field(want: &Option<String>, have: &str) -> bool {
            want.as_deref().is_none_or(|w| w == have)
        }
        (self.include_deleted || !session.is_deleted())
            && field(&self.carve_id, &session.carve_id)
            && field(&self.request_id, &session.request_id)
            && field(&self.node_uuid, &session.node_uuid)
            && field(&self.query_name, &session.query_name)
            && self
                .session_id
                .as_deref()
                .is_none_or(|w| session.session_id.as_deref() == Some(w))
    }
}
