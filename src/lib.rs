//! # media-acquire
//!
//! Download and retrieval pipeline for a media server: jobs name either a
//! direct HTTP source or an NZB document, wait in a priority queue for a
//! download slot, and run through retrieval, repair and extraction before
//! their media is handed to a transcode queue.
//!
//! ## Pipeline
//!
//! - **Admission** - jobs are admitted in `(priority DESC, submission ASC)`
//!   order while fewer than `max_concurrent_jobs` hold a slot.
//! - **Retrieval** - NZB segments are fetched in parallel across every
//!   provider's connections, failing over in provider priority order. HTTP
//!   sources stream to disk, optionally paced at playback speed.
//! - **Reassembly and repair** - segments are written at their yEnc offsets;
//!   gaps are left for par2 repair.
//! - **Extraction** - RAR, 7z and ZIP payloads are unpacked with password
//!   attempts; everything else passes through.
//! - **Transcode** - finished media is converted to the target profile, or
//!   skipped when it already matches.
//!
//! Jobs and their segment state are persisted in SQLite; an interrupted job
//! resumes from its spooled segments on the next start.
//!
//! ## Quick Start
//!
//! ```no_run
//! use media_acquire::{Config, DownloadManager, JobRequest, ProviderConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut provider = ProviderConfig::new("primary", "news.example.com");
//!     provider.username = Some("user".to_string());
//!     provider.password = Some("pass".to_string());
//!
//!     let config = Config {
//!         providers: vec![provider],
//!         ..Default::default()
//!     };
//!
//!     let manager = DownloadManager::new(config).await?;
//!     manager.start().await?;
//!
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let nzb = std::fs::read("movie.nzb")?;
//!     manager.enqueue(JobRequest::nzb(nzb)).await?;
//!
//!     media_acquire::run_with_shutdown(manager).await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// File reassembly from decoded segments
pub mod assembler;
/// Configuration types
pub mod config;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Archive extraction
pub mod extraction;
/// Segment retrieval with provider failover
pub mod fetcher;
/// Direct HTTP downloads
pub mod http;
/// Download queue manager
pub mod manager;
/// NZB parsing
pub mod nzb;
/// Usenet provider sessions and connection pool
pub mod provider;
pub(crate) mod queue;
/// PAR2 verification and repair
pub mod repair;
/// Retry logic with exponential backoff
pub mod retry;
/// Playback-speed rate limiting
pub mod throttle;
/// Transcode queue
pub mod transcode;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Watch folders feeding the transcode queue
pub mod watch_folder;
/// yEnc codec
pub mod yenc;

// Re-export commonly used types
pub use config::{Config, ProviderConfig, TranscodeConfig, WatchFolderConfig};
pub use db::Database;
pub use error::{DatabaseError, Error, FetchError, JobError, NzbError, Result};
pub use manager::{DownloadManager, ManagerBuilder};
pub use provider::{InMemoryConnector, NntpConnector, SessionConnector};
pub use repair::{CliParityHandler, NoOpParityHandler, ParityHandler};
pub use transcode::{FfmpegEncoder, MediaEncoder, TranscodeQueue};
pub use types::{
    CatalogKind, CatalogRef, Event, JobId, JobInfo, JobRequest, JobSource, JobStatus, Priority,
    TaskId, TranscodeInfo, TranscodeStatus,
};

/// Run until a termination signal arrives, then shut the manager down
///
/// - **Unix:** listens for SIGTERM and SIGINT, falling back to Ctrl+C if
///   registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
pub async fn run_with_shutdown(manager: DownloadManager) -> Result<()> {
    wait_for_signal().await;
    manager.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (
        signal(SignalKind::terminate()),
        signal(SignalKind::interrupt()),
    ) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("Received SIGTERM signal"),
                _ = sigint.recv() => tracing::info!("Received SIGINT signal (Ctrl+C)"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("Received SIGTERM signal");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("Received SIGINT signal (Ctrl+C)");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "Could not register any signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("Received Ctrl+C signal"),
        Err(e) => tracing::error!(error = %e, "Failed to listen for Ctrl+C signal"),
    }
}
