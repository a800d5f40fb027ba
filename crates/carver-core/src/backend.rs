//! Backend dispatch for chunk payloads.
//!
//! `db` and `local` keep the base64 payload inline in the chunk row. `s3`
//! uploads the decoded bytes to the object store and keeps a reference of the
//! form `s3://<bucket>/<environment>:<uuid>:<session>:<sequence>` instead.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use crate::model::{CarveChunk, CarverKind};
use carver_storage::{StorageBackend, StorageConfig};
use carver_types::error::{CarveError, Result};

const REFERENCE_SCHEME: &str = "s3://";

/// A configured object store plus the bucket name used in references.
#[derive(Clone)]
pub struct RemoteStore {
    bucket: String,
    storage: Arc<dyn StorageBackend>,
}

impl RemoteStore {
    pub fn new(bucket: impl Into<String>, storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            bucket: bucket.into(),
            storage,
        }
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn storage(&self) -> &dyn StorageBackend {
        self.storage.as_ref()
    }

    /// Deterministic reference for one chunk.
    pub fn reference(
        &self,
        environment: &str,
        node_uuid: &str,
        session_id: &str,
        sequence: u32,
    ) -> String {
        format!(
            "{REFERENCE_SCHEME}{}/{}",
            self.bucket,
            object_key(environment, node_uuid, session_id, sequence)
        )
    }

    /// Object key a reference points at, `None` if the reference belongs to
    /// another bucket or is not a reference at all.
    pub fn key_of<'a>(&self, reference: &'a str) -> Option<&'a str> {
        reference
            .strip_prefix(REFERENCE_SCHEME)?
            .strip_prefix(self.bucket.as_str())?
            .strip_prefix('/')
    }
}

pub fn object_key(environment: &str, node_uuid: &str, session_id: &str, sequence: u32) -> String {
    format!("{environment}:{node_uuid}:{session_id}:{sequence}")
}

/// The deployment's backend selection plus the remote store when one is
/// configured.
#[derive(Clone)]
pub struct Backends {
    kind: CarverKind,
    remote: Option<RemoteStore>,
}

impl Backends {
    pub fn inline(kind: CarverKind) -> Self {
        Self { kind, remote: None }
    }

    pub fn new(kind: CarverKind, remote: Option<RemoteStore>) -> Self {
        Self { kind, remote }
    }

    /// Build backends from the deployment configuration. A missing bucket or
    /// missing credentials leave the remote store unset; remote commits then
    /// fail with `BackendUnavailable` instead of the service refusing to start.
    pub fn from_config(kind: CarverKind, storage: &StorageConfig) -> Result<Self> {
        let remote = match carver_storage::backend_from_config(storage) {
            Ok(backend) => {
                let bucket = storage.bucket.clone().unwrap_or_default();
                Some(RemoteStore::new(bucket, Arc::from(backend)))
            }
            Err(CarveError::BackendUnavailable(reason)) => {
                if kind == CarverKind::S3 {
                    tracing::warn!(%reason, "s3 carver selected but remote store is not configured");
                }
                None
            }
            Err(e) => return Err(e),
        };
        Ok(Self { kind, remote })
    }

    pub fn kind(&self) -> CarverKind {
        self.kind
    }

    pub fn remote(&self) -> Option<&RemoteStore> {
        self.remote.as_ref()
    }

    pub fn require_remote(&self) -> Result<&RemoteStore> {
        self.remote
            .as_ref()
            .ok_or_else(|| CarveError::BackendUnavailable(CarverKind::S3.as_str().to_string()))
    }

    /// Decoded bytes of a stored chunk, fetched from wherever its backend put them.
    pub fn payload(&self, chunk: &CarveChunk) -> Result<Vec<u8>> {
        match chunk.carver {
            CarverKind::Db | CarverKind::Local => decode_inline(chunk),
            CarverKind::S3 => {
                let remote = self.require_remote()?;
                let key = remote.key_of(&chunk.data).ok_or_else(|| CarveError::Decoding {
                    session_id: chunk.session_id.clone(),
                    sequence: chunk.sequence,
                    reason: format!("not a reference into bucket '{}'", remote.bucket),
                })?;
                remote.storage.get(key)?.ok_or_else(|| {
                    CarveError::NotFound(format!("object '{key}' in bucket '{}'", remote.bucket))
                })
            }
        }
    }
}

pub fn decode_inline(chunk: &CarveChunk) -> Result<Vec<u8>> {
    STANDARD
        .decode(chunk.data.trim())
        .map_err(|e| CarveError::Decoding {
            session_id: chunk.session_id.clone(),
            sequence: chunk.sequence,
            reason: e.to_string(),
        })
}
