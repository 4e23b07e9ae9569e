//! Database layer for media-acquire
//!
//! SQLite persistence for the entities the pipeline owns.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by entity:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`jobs`] - Download job records and queue ordering
//! - [`segments`] - Per-segment retrieval state for resume
//! - [`providers`] - Provider configuration mirror
//! - [`transcode`] - Transcode task records

use crate::error::DatabaseError;
use crate::types::{
    CatalogKind, CatalogRef, JobId, JobInfo, JobSource, JobStatus, Priority, SegmentStatus,
    SourceKind, TaskId, TranscodeInfo, TranscodeOrigin, TranscodeStatus,
};
use crate::{Error, Result};
use chrono::{DateTime, TimeZone, Utc};
use sqlx::{FromRow, sqlite::SqlitePool};
use std::path::PathBuf;
use std::sync::atomic::AtomicI64;

mod jobs;
mod migrations;
mod providers;
mod segments;
mod transcode;

/// New job to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Display name
    pub name: String,
    /// Resolved source
    pub source: JobSource,
    /// SHA-256 of the NZB document (NZB jobs only)
    pub nzb_hash: Option<String>,
    /// Archive password supplied with the request
    pub password: Option<String>,
    /// Catalog item this job fulfils
    pub catalog: Option<CatalogRef>,
    /// Directory the final media is moved into
    pub destination: PathBuf,
    /// Whether the result goes to the transcode queue
    pub transcode: bool,
    /// Admission priority
    pub priority: Priority,
    /// Position among jobs of equal priority
    pub queue_seq: i64,
    /// Expected total bytes, 0 if unknown
    pub total_bytes: u64,
}

/// Job record from database
#[derive(Debug, Clone, FromRow)]
pub struct JobRow {
    /// Unique database ID
    pub id: i64,
    /// Display name
    pub name: String,
    /// "http" or "nzb"
    pub source_kind: String,
    /// Source URL for HTTP jobs
    pub http_url: Option<String>,
    /// Playback simulation flag for HTTP jobs (0/1)
    pub http_simulate: i32,
    /// Declared bitrate for HTTP jobs
    pub http_bitrate: Option<i64>,
    /// Raw NZB document for NZB jobs
    pub nzb_content: Option<Vec<u8>>,
    /// SHA-256 of the NZB document
    pub nzb_hash: Option<String>,
    /// Archive password supplied with the request
    pub password: Option<String>,
    /// "movie" or "episode"
    pub catalog_kind: Option<String>,
    /// External catalog identifier
    pub catalog_id: Option<i64>,
    /// Destination directory
    pub destination: String,
    /// Transcode handoff flag (0/1)
    pub transcode: i32,
    /// Admission priority (0-100)
    pub priority: i32,
    /// Position among jobs of equal priority
    pub queue_seq: i64,
    /// Status code (see [`JobStatus::to_i32`])
    pub status: i32,
    /// Expected total bytes
    pub total_bytes: i64,
    /// Bytes retrieved so far
    pub downloaded_bytes: i64,
    /// Working directory
    pub temp_path: Option<String>,
    /// Final media path
    pub final_path: Option<String>,
    /// Last recorded error
    pub error_message: Option<String>,
    /// Retries used
    pub retry_count: i64,
    /// Unix timestamp when the job was enqueued
    pub created_at: i64,
    /// Unix timestamp when the current attempt started
    pub started_at: Option<i64>,
    /// Unix timestamp when the job reached a terminal state
    pub completed_at: Option<i64>,
}

impl JobRow {
    /// Current status
    pub fn status(&self) -> JobStatus {
        JobStatus::from_i32(self.status)
    }

    /// Reconstruct the job's source
    pub fn source(&self) -> Result<JobSource> {
        match SourceKind::parse(&self.source_kind) {
            Some(SourceKind::Http) => Ok(JobSource::Http {
                url: self.http_url.clone().ok_or_else(|| corrupt_row(self.id, "http_url"))?,
                simulate_playback: self.http_simulate != 0,
                bitrate_bps: self.http_bitrate.map(|b| b as u64),
            }),
            Some(SourceKind::Nzb) => Ok(JobSource::Nzb {
                content: self
                    .nzb_content
                    .clone()
                    .ok_or_else(|| corrupt_row(self.id, "nzb_content"))?,
            }),
            None => Err(corrupt_row(self.id, "source_kind")),
        }
    }

    /// Snapshot for callers
    pub fn to_info(&self) -> JobInfo {
        JobInfo {
            id: JobId(self.id),
            name: self.name.clone(),
            source_kind: SourceKind::parse(&self.source_kind).unwrap_or(SourceKind::Nzb),
            status: self.status(),
            priority: Priority::new(i64::from(self.priority)),
            catalog: self
                .catalog_kind
                .as_deref()
                .and_then(CatalogKind::parse)
                .zip(self.catalog_id)
                .map(|(kind, id)| CatalogRef { kind, id }),
            total_bytes: self.total_bytes.max(0) as u64,
            downloaded_bytes: self.downloaded_bytes.max(0) as u64,
            temp_path: self.temp_path.as_ref().map(PathBuf::from),
            final_path: self.final_path.as_ref().map(PathBuf::from),
            error: self.error_message.clone(),
            retry_count: self.retry_count.max(0) as u32,
            created_at: timestamp(self.created_at),
            started_at: self.started_at.map(timestamp),
            completed_at: self.completed_at.map(timestamp),
        }
    }
}

/// Segment record from database
#[derive(Debug, Clone, FromRow)]
pub struct SegmentRow {
    /// Owning job
    pub job_id: i64,
    /// File position in the plan
    pub file_index: i64,
    /// Segment position in the file
    pub segment_index: i64,
    /// Usenet message-id
    pub message_id: String,
    /// Declared size
    pub size_bytes: i64,
    /// Status code (see [`SegmentStatus::to_i32`])
    pub status: i32,
    /// Provider that served or last tried the segment
    pub provider: Option<String>,
    /// Fetch attempts across all providers
    pub attempts: i64,
    /// Last failure
    pub last_error: Option<String>,
    /// Whole-file size declared by the encoder
    pub file_size: Option<i64>,
    /// Spooled decoded bytes
    pub spool_path: Option<String>,
    /// Zero-based position of the spooled bytes within the file
    pub part_offset: Option<i64>,
}

impl SegmentRow {
    /// Current status
    pub fn status(&self) -> SegmentStatus {
        SegmentStatus::from_i32(self.status)
    }
}

/// A change to one segment's retrieval state
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentUpdate {
    /// File position in the plan
    pub file_index: usize,
    /// Segment position in the file
    pub segment_index: usize,
    /// New status
    pub status: SegmentStatus,
    /// Provider involved
    pub provider: Option<String>,
    /// Total attempts so far
    pub attempts: u32,
    /// Failure, if any
    pub last_error: Option<String>,
    /// Whole-file size declared by the encoder
    pub file_size: Option<u64>,
    /// Spooled decoded bytes
    pub spool_path: Option<PathBuf>,
    /// Zero-based position of the spooled bytes within the file
    pub part_offset: Option<u64>,
}

/// Provider configuration record from database
#[derive(Debug, Clone, FromRow)]
pub struct ProviderRow {
    /// Unique provider name
    pub name: String,
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: i64,
    /// TLS flag (0/1)
    pub tls: i32,
    /// Username
    pub username: Option<String>,
    /// Password
    pub password: Option<String>,
    /// Connection limit
    pub connections: i64,
    /// Lower is tried first
    pub priority: i64,
    /// Enabled flag (0/1)
    pub enabled: i32,
    /// Retention in days
    pub retention_days: Option<i64>,
}

impl From<ProviderRow> for crate::config::ProviderConfig {
    fn from(row: ProviderRow) -> Self {
        crate::config::ProviderConfig {
            name: row.name,
            host: row.host,
            port: row.port.clamp(0, i64::from(u16::MAX)) as u16,
            tls: row.tls != 0,
            username: row.username,
            password: row.password,
            connections: row.connections.max(0) as usize,
            priority: row.priority as i32,
            enabled: row.enabled != 0,
            retention_days: row.retention_days.map(|d| d.max(0) as u32),
        }
    }
}

/// New transcode task to be inserted into the database
#[derive(Debug, Clone)]
pub struct NewTranscodeTask {
    /// Owning job, if any
    pub job_id: Option<JobId>,
    /// Input media
    pub source_path: PathBuf,
    /// Output media
    pub target_path: PathBuf,
    /// Admission priority
    pub priority: Priority,
    /// Position among tasks of equal priority
    pub queue_seq: i64,
    /// Task origin
    pub origin: TranscodeOrigin,
}

/// Transcode task record from database
#[derive(Debug, Clone, FromRow)]
pub struct TranscodeRow {
    /// Unique database ID
    pub id: i64,
    /// Owning job
    pub job_id: Option<i64>,
    /// Input media
    pub source_path: String,
    /// Output media
    pub target_path: String,
    /// Status code (see [`TranscodeStatus::to_i32`])
    pub status: i32,
    /// Admission priority
    pub priority: i32,
    /// Position among tasks of equal priority
    pub queue_seq: i64,
    /// Known media duration
    pub duration_secs: Option<f64>,
    /// "download" or "watch-folder"
    pub origin: String,
    /// Last recorded error
    pub error_message: Option<String>,
    /// Retries used
    pub retry_count: i64,
    /// Unix timestamp when the task was created
    pub created_at: i64,
    /// Unix timestamp when encoding started
    pub started_at: Option<i64>,
    /// Unix timestamp when the task reached a terminal state
    pub completed_at: Option<i64>,
}

impl TranscodeRow {
    /// Current status
    pub fn status(&self) -> TranscodeStatus {
        TranscodeStatus::from_i32(self.status)
    }

    /// Snapshot for callers
    pub fn to_info(&self) -> TranscodeInfo {
        TranscodeInfo {
            id: TaskId(self.id),
            job_id: self.job_id.map(JobId),
            source_path: PathBuf::from(&self.source_path),
            target_path: PathBuf::from(&self.target_path),
            status: self.status(),
            priority: Priority::new(i64::from(self.priority)),
            duration_secs: self.duration_secs,
            origin: TranscodeOrigin::parse(&self.origin).unwrap_or(TranscodeOrigin::Download),
            error: self.error_message.clone(),
            retry_count: self.retry_count.max(0) as u32,
            created_at: timestamp(self.created_at),
            started_at: self.started_at.map(timestamp),
            completed_at: self.completed_at.map(timestamp),
        }
    }
}

fn timestamp(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_else(Utc::now)
}

fn corrupt_row(id: i64, column: &str) -> Error {
    Error::Database(DatabaseError::QueryFailed(format!(
        "job {id} has no usable {column}"
    )))
}

fn query_failed(what: &'static str) -> impl FnOnce(sqlx::Error) -> Error {
    move |e| Error::Database(DatabaseError::QueryFailed(format!("{what}: {e}")))
}

/// Database handle for media-acquire
pub struct Database {
    pool: SqlitePool,
    /// Last queue position handed out, shared by jobs and transcode tasks
    queue_seq: AtomicI64,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
