use std::io::Read;
use std::time::Duration;

use rusty_s3::actions::S3Action;
use rusty_s3::{Bucket, Credentials, UrlStyle};

use crate::retry::{retry_http, HttpRetryError};
use crate::{RetryConfig, StorageBackend};
use carver_types::error::{CarveError, Result};

/// Validity window of the presigned URLs issued for each request.
const PRESIGN_DURATION: Duration = Duration::from_secs(3600);

/// S3-compatible object store reached through presigned requests.
pub struct S3Backend {
    bucket: Bucket,
    credentials: Credentials,
    agent: ureq::Agent,
    retry: RetryConfig,
    /// Prefix prepended to all keys, without surrounding slashes.
    root: String,
}

impl S3Backend {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        bucket_name: &str,
        region: &str,
        root: &str,
        endpoint: &str,
        access_key_id: &str,
        secret_access_key: &str,
        timeout: Duration,
        retry: RetryConfig,
    ) -> Result<Self> {
        let base_url = endpoint
            .parse()
            .map_err(|e| CarveError::Config(format!("invalid S3 endpoint URL '{endpoint}': {e}")))?;

        let bucket = Bucket::new(
            base_url,
            UrlStyle::Path,
            bucket_name.to_string(),
            region.to_string(),
        )
        .map_err(|e| CarveError::Config(format!("failed to create S3 bucket handle: {e}")))?;

        let agent = ureq::AgentBuilder::new()
            .timeout_connect(timeout.min(Duration::from_secs(30)))
            .timeout_read(timeout)
            .timeout_write(timeout)
            .build();

        Ok(Self {
            bucket,
            credentials: Credentials::new(access_key_id, secret_access_key),
            agent,
            retry,
            root: root.trim_matches('/').to_string(),
        })
    }

    fn full_key(&self, key: &str) -> String {
        if self.root.is_empty() {
            key.to_string()
        } else {
            format!("{}/{}", self.root, key)
        }
    }
}

impl StorageBackend for S3Backend {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let url = self
            .bucket
            .get_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        retry_http(&self.retry, &format!("GET {key}"), || {
            match self.agent.get(url.as_str()).call() {
                Ok(resp) => {
                    let mut buf = Vec::new();
                    resp.into_reader()
                        .read_to_end(&mut buf)
                        .map_err(HttpRetryError::BodyIo)?;
                    Ok(Some(buf))
                }
                Err(ureq::Error::Status(404, _)) => Ok(None),
                Err(e) => Err(HttpRetryError::http(e)),
            }
        })
        .map_err(|e| CarveError::Remote(format!("S3 GET {key}: {e}")))
    }

    fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        let url = self
            .bucket
            .put_object(Some(&self.credentials), &self.full_key(key))
            .sign(PRESIGN_DURATION);

        retry_http(&self.retry, &format!("PUT {key}"), || {
            self.agent
                .put(url.as_str())
                .set("Content-Type", "application/octet-stream")
                .send_bytes(data)
                .map_err(HttpRetryError::http)
        })
        .map_err(|e| CarveError::Remote(format!("S3 PUT {key}: {e}")))?;
        tracing::debug!(key, bytes = data.len(), "uploaded object");
        Ok(())
    }

}
