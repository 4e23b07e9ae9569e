//! Retry with exponential backoff
//!
//! Used by the HTTP path for connection-level failures. Segment retrieval does
//! not use it: a segment moves to the next provider instead of backing off.
//!
//! # Example
//!
//! ```no_run
//! use media_acquire::retry::{IsRetryable, with_retry};
//! use media_acquire::config::RetryConfig;
//!
//! #[derive(Debug)]
//! enum FetchFailure {
//!     Reset,
//!     Gone,
//! }
//!
//! impl std::fmt::Display for FetchFailure {
//!     fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
//!         write!(f, "{self:?}")
//!     }
//! }
//!
//! impl IsRetryable for FetchFailure {
//!     fn is_retryable(&self) -> bool {
//!         matches!(self, FetchFailure::Reset)
//!     }
//! }
//!
//! # async fn example() -> Result<(), FetchFailure> {
//! let config = RetryConfig::default();
//! with_retry(&config, || async { Ok::<_, FetchFailure>(()) }).await?;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::{Error, JobError};
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Classifies an error as worth another attempt
pub trait IsRetryable {
    /// Whether the failed operation may succeed if repeated
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for Error {
    fn is_retryable(&self) -> bool {
        match self {
            Error::Network(e) => e.is_timeout() || e.is_connect() || e.is_body(),
            Error::HttpStatus { status, .. } => {
                *status == 408 || *status == 429 || (500..600).contains(status)
            }
            Error::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::TimedOut
                    | std::io::ErrorKind::ConnectionRefused
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::NotConnected
                    | std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::UnexpectedEof
                    | std::io::ErrorKind::Interrupted
            ),
            Error::Nntp(msg) => {
                msg.contains("timeout")
                    || msg.contains("busy")
                    || msg.contains("connection")
                    || msg.contains("temporary")
            }
            Error::Job(JobError::TransientNetwork(_)) => true,
            Error::ExternalTool(msg) => {
                msg.contains("timeout") || msg.contains("busy") || msg.contains("temporary")
            }
            // Everything else needs a different input or user action
            Error::Job(_)
            | Error::Config { .. }
            | Error::Database(_)
            | Error::Sqlx(_)
            | Error::InvalidNzb(_)
            | Error::NotFound(_)
            | Error::ShuttingDown
            | Error::Serialization(_)
            | Error::FolderWatch(_)
            | Error::Duplicate(_)
            | Error::WrongPassword { .. }
            | Error::NotSupported(_)
            | Error::Transcode(_)
            | Error::Other(_) => false,
        }
    }
}

/// Run `operation` until it succeeds, fails permanently, or exhausts
/// `config.max_attempts` retries
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempts = attempt + 1, "Operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                tracing::warn!(
                    error = %e,
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "Operation failed, retrying"
                );

                let wait = if config.jitter { add_jitter(delay) } else { delay };
                tokio::time::sleep(wait).await;

                delay = Duration::from_secs_f64(delay.as_secs_f64() * config.backoff_multiplier)
                    .min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(error = %e, attempts = attempt + 1, "Retries exhausted");
                } else {
                    tracing::debug!(error = %e, "Operation failed with non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Stretch `delay` by a uniform factor in `[1, 2]`
fn add_jitter(delay: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(1.0..=2.0);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}
