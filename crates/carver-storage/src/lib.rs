pub mod retry;
pub mod s3_backend;

use std::time::Duration;

use serde::{Deserialize, Serialize};

use carver_types::error::{CarveError, Result};

pub use s3_backend::S3Backend;

/// Keyed object storage used for chunk payloads that do not live in the record store.
///
/// Implementations must be shareable across upload workers; every method may be
/// called concurrently for different keys.
pub trait StorageBackend: Send + Sync {
    /// Read an object. Returns `None` if it does not exist.
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Write an object, replacing any previous content.
    fn put(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Write an object from an owned buffer.
    fn put_owned(&self, key: &str, data: Vec<u8>) -> Result<()> {
        self.put(key, &data)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries).
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Initial delay between retries in milliseconds.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    /// Upper bound for the exponential backoff in milliseconds.
    #[serde(default = "default_retry_max_delay_ms")]
    pub retry_max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_retry_max_delay_ms() -> u64 {
    10_000
}

/// Connection settings for the remote object store.
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub bucket: Option<String>,
    pub region: String,
    /// Explicit endpoint, e.g. a MinIO URL. Defaults to the AWS regional endpoint.
    pub endpoint: Option<String>,
    /// Key prefix prepended to every object key.
    pub root: String,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    /// Per-request I/O deadline.
    pub timeout: Duration,
    pub retry: RetryConfig,
}

/// Build the remote object store described by `cfg`.
///
/// Fails with [`CarveError::BackendUnavailable`] when the bucket or the
/// credentials are missing, so callers can keep running with the remote
/// backend switched off.
pub fn backend_from_config(cfg: &StorageConfig) -> Result<Box<dyn StorageBackend>> {
    let bucket = required(cfg.bucket.as_deref(), "bucket")?;
    let access_key_id = required(cfg.access_key_id.as_deref(), "access_key_id")?;
    let secret_access_key = required(cfg.secret_access_key.as_deref(), "secret_access_key")?;
    let region = if cfg.region.is_empty() {
        "us-east-1"
    } else {
        cfg.region.as_str()
    };
    let endpoint = cfg
        .endpoint
        .clone()
        .unwrap_or_else(|| format!("https://s3.{region}.amazonaws.com"));

    let backend = S3Backend::new(
        bucket,
        region,
        &cfg.root,
        &endpoint,
        access_key_id,
        secret_access_key,
        cfg.timeout,
        cfg.retry.clone(),
    )?;
    Ok(Box::new(backend))
}

fn required<'a>(value: Option<&'a str>, field: &str) -> Result<&'a str> {
    match value {
        Some(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(CarveError::BackendUnavailable(format!("s3 (missing {field})"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_config() -> StorageConfig {
        StorageConfig {
            bucket: Some("carves".into()),
            region: "eu-west-1".into(),
            endpoint: Some("http://127.0.0.1:9000".into()),
            root: String::new(),
            access_key_id: Some("AKIA".into()),
            secret_access_key: Some("secret".into()),
            timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    #[test]
    fn missing_credentials_is_backend_unavailable() {
        let cfg = StorageConfig {
            secret_access_key: None,
            ..full_config()
        };
        match backend_from_config(&cfg) {
            Err(CarveError::BackendUnavailable(msg)) => {
                assert!(msg.contains("secret_access_key"), "unexpected: {msg}")
            }
            Err(e) => panic!("unexpected error: {e}"),
            Ok(_) => panic!("expected BackendUnavailable"),
        }
    }

    #[test]
    fn blank_bucket_is_backend_unavailable() {
        let cfg = StorageConfig {
            bucket: Some("  ".into()),
            ..full_config()
        };
        assert!(matches!(
            backend_from_config(&cfg),
            Err(CarveError::BackendUnavailable(_))
        ));
    }

    #[test]
    fn complete_config_builds_backend() {
        assert!(backend_from_config(&full_config()).is_ok());
    }

    #[test]
    fn invalid_endpoint_is_config_error() {
        let cfg = StorageConfig {
            endpoint: Some("not a url".into()),
            ..full_config()
        };
        assert!(matches!(
            backend_from_config(&cfg),
            Err(CarveError::Config(_))
        ));
    }
}
