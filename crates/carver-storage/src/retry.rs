use std::fmt;
use std::time::Duration;

use crate::RetryConfig;

/// Failure of one HTTP round trip, request plus body read.
pub enum HttpRetryError {
    /// HTTP-level error (transport, 429 and 5xx are retried).
    Http(Box<ureq::Error>),
    /// Body read failed after the response started.
    BodyIo(std::io::Error),
    /// Never retried.
    Permanent(String),
}

impl HttpRetryError {
    pub fn http(e: ureq::Error) -> Self {
        HttpRetryError::Http(Box::new(e))
    }

    fn is_transient(&self) -> bool {
        match self {
            HttpRetryError::Http(e) => is_retryable_http(e),
            HttpRetryError::BodyIo(e) => is_retryable_io(e),
            HttpRetryError::Permanent(_) => false,
        }
    }
}

impl fmt::Display for HttpRetryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HttpRetryError::Http(e) => write!(f, "{e}"),
            HttpRetryError::BodyIo(e) => write!(f, "body read error: {e}"),
            HttpRetryError::Permanent(msg) => write!(f, "{msg}"),
        }
    }
}

impl From<ureq::Error> for HttpRetryError {
    fn from(e: ureq::Error) -> Self {
        HttpRetryError::http(e)
    }
}

pub fn is_retryable_http(err: &ureq::Error) -> bool {
    match err {
        ureq::Error::Transport(_) => true,
        ureq::Error::Status(code, _) => *code == 429 || *code >= 500,
    }
}

pub fn is_retryable_io(err: &std::io::Error) -> bool {
    matches!(
        err.kind(),
        std::io::ErrorKind::ConnectionReset
            | std::io::ErrorKind::ConnectionAborted
            | std::io::ErrorKind::BrokenPipe
            | std::io::ErrorKind::UnexpectedEof
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::Interrupted
    )
}

/// Delay before retry number `attempt` (1-based): doubles from the base delay,
/// capped at the configured maximum, before jitter is added.
fn backoff_ms(config: &RetryConfig, attempt: usize) -> u64 {
    let shift = attempt.saturating_sub(1).min(32) as u32;
    config
        .retry_delay_ms
        .saturating_mul(1u64 << shift)
        .min(config.retry_max_delay_ms)
}

/// Run `f` until it succeeds, fails permanently, or runs out of attempts.
pub fn retry_http<T>(
    config: &RetryConfig,
    op_name: &str,
    f: impl Fn() -> std::result::Result<T, HttpRetryError>,
) -> std::result::Result<T, HttpRetryError> {
    let mut attempt = 0;
    loop {
        match f() {
            Ok(val) => return Ok(val),
            Err(e) if e.is_transient() && attempt < config.max_retries => {
                attempt += 1;
                let delay = backoff_ms(config, attempt);
                let jitter = rand::random::<u64>() % delay.max(1);
                tracing::warn!(
                    op = op_name,
                    attempt,
                    max_retries = config.max_retries,
                    "transient storage error, retrying: {e}"
                );
                std::thread::sleep(Duration::from_millis(delay + jitter));
            }
            Err(e) => return Err(e),
        }
    }
}
