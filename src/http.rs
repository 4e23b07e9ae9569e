//! Direct HTTP/IPTV downloads
//!
//! The body is streamed into a `.part` file inside the job's temp directory.
//! An interrupted transfer resumes from the bytes already on disk when the
//! server honours `Range` (answers `206`); otherwise it starts over. Transient
//! failures are retried with backoff, and playback simulation caps the rate
//! with a [`PlaybackThrottle`].

use crate::config::HttpConfig;
use crate::error::{Error, JobError, Result};
use crate::retry::with_retry;
use crate::throttle::PlaybackThrottle;
use crate::utils::filename_from_response;
use futures::{FutureExt, StreamExt};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

const PART_FILE: &str = "download.part";

/// Byte counters shared with the job's progress reporter
#[derive(Debug, Default)]
pub struct TransferProgress {
    downloaded: AtomicU64,
    total: AtomicU64,
}

impl TransferProgress {
    /// Bytes on disk so far
    pub fn downloaded(&self) -> u64 {
        self.downloaded.load(Ordering::Relaxed)
    }

    /// Expected size, 0 when the server did not say
    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// A finished transfer, still in the temp directory
#[derive(Debug, Clone)]
pub struct HttpDownload {
    /// The completed `.part` file
    pub path: PathBuf,
    /// Name the server suggested (Content-Disposition or URL path)
    pub filename: String,
    /// Bytes written
    pub bytes: u64,
}

/// Streams HTTP sources to disk
#[derive(Clone)]
pub struct HttpDownloader {
    client: reqwest::Client,
    config: HttpConfig,
}

impl HttpDownloader {
    /// Downloader with a client built from `config`
    pub fn new(config: &HttpConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .user_agent(config.user_agent.clone())
            .build()?;
        Ok(Self {
            client,
            config: config.clone(),
        })
    }

    /// Bitrate to simulate playback at: the declared one, or the configured default
    pub fn playback_bitrate(&self, declared_bps: Option<u64>) -> u64 {
        declared_bps.unwrap_or(self.config.default_bitrate_bps)
    }

    /// Download `url` into `temp_dir`
    ///
    /// `playback_bps` enables playback simulation for a stream of that bitrate.
    /// Cancellation aborts the transfer between chunks and returns
    /// [`JobError::Cancelled`].
    pub async fn download(
        &self,
        url: &str,
        temp_dir: &Path,
        playback_bps: Option<u64>,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<HttpDownload> {
        tokio::fs::create_dir_all(temp_dir).await?;
        let part = temp_dir.join(PART_FILE);

        let (filename, bytes) = with_retry(&self.config.retry, || {
            self.attempt(url, &part, playback_bps, progress, cancel).boxed()
        })
        .await?;

        tracing::info!(url, bytes, file = %filename, "HTTP transfer finished");
        Ok(HttpDownload {
            path: part,
            filename,
            bytes,
        })
    }

    async fn attempt(
        &self,
        url: &str,
        part: &Path,
        playback_bps: Option<u64>,
        progress: &TransferProgress,
        cancel: &CancellationToken,
    ) -> Result<(String, u64)> {
        let existing = match tokio::fs::metadata(part).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        let mut request = self.client.get(url);
        if existing > 0 {
            request = request.header(RANGE, format!("bytes={existing}-"));
        }
        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(JobError::Cancelled.into()),
            response = request.send() => response?,
        };

        let status = response.status();
        let resumed = status == StatusCode::PARTIAL_CONTENT && existing > 0;
        if !status.is_success() {
            return Err(Error::HttpStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }

        let offset = if resumed { existing } else { 0 };
        let total = content_range_total(response.headers())
            .or_else(|| response.content_length().map(|len| len + offset))
            .unwrap_or(0);
        progress.total.store(total, Ordering::Relaxed);
        progress.downloaded.store(offset, Ordering::Relaxed);

        if existing > 0 {
            if resumed {
                tracing::debug!(url, offset, "Resuming HTTP transfer");
            } else {
                tracing::debug!(url, discarded = existing, "Server ignored Range, restarting");
            }
        }

        let filename = filename_from_response(response.headers(), url);
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .append(resumed)
            .truncate(!resumed)
            .open(part)
            .await?;

        let mut throttle = playback_bps.and_then(|bitrate| {
            PlaybackThrottle::for_bitrate(bitrate, self.config.playback_multiplier)
        });
        let mut written = offset;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => {
                    file.flush().await?;
                    return Err(JobError::Cancelled.into());
                }
                next = tokio::time::timeout(self.config.request_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        format!("no data from {url} for {:?}", self.config.request_timeout),
                    )));
                }
                Ok(None) => break,
                Ok(Some(chunk)) => match chunk {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        file.flush().await?;
                        return Err(e.into());
                    }
                },
            };

            if let Some(throttle) = throttle.as_mut() {
                throttle.acquire(chunk.len() as u64).await;
            }
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            progress.downloaded.store(written, Ordering::Relaxed);
        }

        file.flush().await?;
        file.sync_all().await?;

        if total > 0 && written != total {
            return Err(JobError::TransientNetwork(format!(
                "{url}: stream ended after {written} of {total} bytes"
            ))
            .into());
        }
        Ok((filename, written))
    }
}

/// Total size from `Content-Range: bytes a-b/total`
fn content_range_total(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .parse()
        .ok()
}
