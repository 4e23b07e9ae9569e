//! Core types for media-acquire

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

macro_rules! id_newtype {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl $name {
            /// Get the inner i64 value
            pub fn get(&self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(id: i64) -> Self {
                Self(id)
            }
        }

        impl From<$name> for i64 {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::str::FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Ok(Self(s.parse()?))
            }
        }

        impl sqlx::Type<sqlx::Sqlite> for $name {
            fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
                <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
            }

            fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
                <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
            }
        }

        impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for $name {
            fn encode_by_ref(
                &self,
                buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
            ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
                sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
            }
        }

        impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for $name {
            fn decode(
                value: sqlx::sqlite::SqliteValueRef<'r>,
            ) -> Result<Self, sqlx::error::BoxDynError> {
                let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
                Ok(Self(id))
            }
        }
    };
}

id_newtype!(
    /// Unique identifier for a download job
    JobId
);

id_newtype!(
    /// Unique identifier for a transcode task
    TaskId
);

/// Job priority in the range 0-100; higher values are admitted first
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Priority(u8);

impl Priority {
    /// Lowest priority
    pub const MIN: Priority = Priority(0);
    /// Highest priority
    pub const MAX: Priority = Priority(100);

    /// Create a priority, clamping into 0-100
    pub fn new(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    /// Get the numeric value
    pub fn get(&self) -> u8 {
        self.0
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self(50)
    }
}

impl From<u8> for Priority {
    fn from(value: u8) -> Self {
        Self::new(i64::from(value))
    }
}

/// Lifecycle status of a download job
///
/// Stages advance in declaration order. `Failed` and `Cancelled` are reachable from any
/// non-terminal state; `Completed`, `Failed` and `Cancelled` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for a download slot
    Queued,
    /// Fetching segments or streaming from HTTP
    Downloading,
    /// Verifying and repairing with redundancy data
    Repairing,
    /// Unpacking archives
    Extracting,
    /// Handed to the transcode queue
    Transcoding,
    /// Final media in place
    Completed,
    /// Terminal failure after the retry budget
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobStatus {
    /// Convert integer status code to JobStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => JobStatus::Queued,
            1 => JobStatus::Downloading,
            2 => JobStatus::Repairing,
            3 => JobStatus::Extracting,
            4 => JobStatus::Transcoding,
            5 => JobStatus::Completed,
            6 => JobStatus::Failed,
            7 => JobStatus::Cancelled,
            _ => JobStatus::Failed,
        }
    }

    /// Convert JobStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            JobStatus::Queued => 0,
            JobStatus::Downloading => 1,
            JobStatus::Repairing => 2,
            JobStatus::Extracting => 3,
            JobStatus::Transcoding => 4,
            JobStatus::Completed => 5,
            JobStatus::Failed => 6,
            JobStatus::Cancelled => 7,
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    /// Whether the job currently occupies a pipeline stage
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobStatus::Downloading
                | JobStatus::Repairing
                | JobStatus::Extracting
                | JobStatus::Transcoding
        )
    }

    /// Whether `next` is a legal successor of this status.
    ///
    /// Forward moves may skip stages (HTTP jobs go straight from downloading to
    /// transcoding). Returning to `Queued` from an active stage is a retry.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            JobStatus::Failed | JobStatus::Cancelled => true,
            JobStatus::Queued => self.is_active(),
            _ => next.to_i32() > self.to_i32(),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobStatus::Queued => "queued",
            JobStatus::Downloading => "downloading",
            JobStatus::Repairing => "repairing",
            JobStatus::Extracting => "extracting",
            JobStatus::Transcoding => "transcoding",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Kind of source a job acquires from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Direct HTTP/IPTV stream
    Http,
    /// Usenet retrieval described by an NZB document
    Nzb,
}

impl SourceKind {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKind::Http => "http",
            SourceKind::Nzb => "nzb",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "http" => Some(SourceKind::Http),
            "nzb" => Some(SourceKind::Nzb),
            _ => None,
        }
    }
}

/// Resolved source of a job
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum JobSource {
    /// Stream a URL straight to the final path
    Http {
        /// Source URL
        url: String,
        /// Throttle the transfer to a multiple of the stream bitrate
        #[serde(default)]
        simulate_playback: bool,
        /// Known bitrate of the stream in bits per second
        #[serde(default)]
        bitrate_bps: Option<u64>,
    },
    /// Retrieve the articles listed in an NZB document
    Nzb {
        /// Raw NZB document
        content: Vec<u8>,
    },
}

impl JobSource {
    /// The source kind discriminant
    pub fn kind(&self) -> SourceKind {
        match self {
            JobSource::Http { .. } => SourceKind::Http,
            JobSource::Nzb { .. } => SourceKind::Nzb,
        }
    }
}

/// Kind of catalog item a job was requested for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CatalogKind {
    /// A movie
    Movie,
    /// A series episode
    Episode,
}

impl CatalogKind {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            CatalogKind::Movie => "movie",
            CatalogKind::Episode => "episode",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "movie" => Some(CatalogKind::Movie),
            "episode" => Some(CatalogKind::Episode),
            _ => None,
        }
    }
}

/// Reference to a catalog item owned by an external collaborator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CatalogRef {
    /// Item kind
    pub kind: CatalogKind,
    /// Identifier in the external catalog
    pub id: i64,
}

/// Request to enqueue a new job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobRequest {
    /// Resolved source
    pub source: JobSource,
    /// Admission priority
    #[serde(default)]
    pub priority: Priority,
    /// Optional catalog item this job fulfils
    #[serde(default)]
    pub catalog: Option<CatalogRef>,
    /// Display name (defaults to NZB title or URL filename)
    #[serde(default)]
    pub name: Option<String>,
    /// Override the configured download directory
    #[serde(default)]
    pub destination: Option<PathBuf>,
    /// Hand the result to the transcode queue when enabled
    #[serde(default = "default_true")]
    pub transcode: bool,
    /// Archive password, tried before the NZB's own
    #[serde(default)]
    pub password: Option<String>,
}

fn default_true() -> bool {
    true
}

impl JobRequest {
    /// Request for an NZB document
    pub fn nzb(content: impl Into<Vec<u8>>) -> Self {
        Self::from_source(JobSource::Nzb {
            content: content.into(),
        })
    }

    /// Request for a direct HTTP download
    pub fn http(url: impl Into<String>) -> Self {
        Self::from_source(JobSource::Http {
            url: url.into(),
            simulate_playback: false,
            bitrate_bps: None,
        })
    }

    fn from_source(source: JobSource) -> Self {
        Self {
            source,
            priority: Priority::default(),
            catalog: None,
            name: None,
            destination: None,
            transcode: true,
            password: None,
        }
    }

    /// Set the priority
    pub fn with_priority(mut self, priority: impl Into<Priority>) -> Self {
        self.priority = priority.into();
        self
    }

    /// Set the archive password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the display name
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Attach a catalog reference
    pub fn with_catalog(mut self, catalog: CatalogRef) -> Self {
        self.catalog = Some(catalog);
        self
    }

    /// Override the destination directory
    pub fn with_destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination = Some(destination.into());
        self
    }
}

/// Retrieval status of a single segment
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SegmentStatus {
    /// Not yet attempted in this run
    Pending,
    /// A fetch is in flight
    Fetching,
    /// Decoded bytes are spooled on disk
    Done,
    /// Every eligible provider was exhausted
    Failed,
}

impl SegmentStatus {
    /// Convert integer status code to SegmentStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            1 => SegmentStatus::Fetching,
            2 => SegmentStatus::Done,
            3 => SegmentStatus::Failed,
            _ => SegmentStatus::Pending,
        }
    }

    /// Convert SegmentStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            SegmentStatus::Pending => 0,
            SegmentStatus::Fetching => 1,
            SegmentStatus::Done => 2,
            SegmentStatus::Failed => 3,
        }
    }
}

/// Status of a transcode task
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscodeStatus {
    /// Waiting for an encoder slot
    Queued,
    /// Encoder running
    Running,
    /// Output written
    Completed,
    /// Source already satisfies the target profile
    Skipped,
    /// Terminal failure
    Failed,
    /// Cancelled by the user or with its job
    Cancelled,
}

impl TranscodeStatus {
    /// Convert integer status code to TranscodeStatus
    pub fn from_i32(status: i32) -> Self {
        match status {
            0 => TranscodeStatus::Queued,
            1 => TranscodeStatus::Running,
            2 => TranscodeStatus::Completed,
            3 => TranscodeStatus::Skipped,
            5 => TranscodeStatus::Cancelled,
            _ => TranscodeStatus::Failed,
        }
    }

    /// Convert TranscodeStatus to integer status code
    pub fn to_i32(&self) -> i32 {
        match self {
            TranscodeStatus::Queued => 0,
            TranscodeStatus::Running => 1,
            TranscodeStatus::Completed => 2,
            TranscodeStatus::Skipped => 3,
            TranscodeStatus::Failed => 4,
            TranscodeStatus::Cancelled => 5,
        }
    }

    /// Whether no further transitions are possible
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TranscodeStatus::Queued | TranscodeStatus::Running)
    }
}

/// Where a transcode task came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TranscodeOrigin {
    /// Output of a completed download job
    Download,
    /// Media file found in a watch folder
    WatchFolder,
}

impl TranscodeOrigin {
    /// Database representation
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscodeOrigin::Download => "download",
            TranscodeOrigin::WatchFolder => "watch-folder",
        }
    }

    /// Parse the database representation
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "download" => Some(TranscodeOrigin::Download),
            "watch-folder" => Some(TranscodeOrigin::WatchFolder),
            _ => None,
        }
    }
}

/// Event emitted during job and transcode lifecycles
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// Job added to the queue
    Queued {
        /// Job ID
        id: JobId,
        /// Job name
        name: String,
    },

    /// Job entered a pipeline stage
    StageEntered {
        /// Job ID
        id: JobId,
        /// The stage entered
        status: JobStatus,
    },

    /// Download progress
    Progress {
        /// Job ID
        id: JobId,
        /// Bytes retrieved so far
        downloaded_bytes: u64,
        /// Expected total bytes (0 if unknown)
        total_bytes: u64,
        /// Progress percentage (0.0 to 100.0)
        percent: f32,
        /// Current speed in bytes per second
        speed_bps: u64,
    },

    /// A provider was excluded for the rest of the job
    ProviderExcluded {
        /// Job ID
        id: JobId,
        /// Provider name
        provider: String,
        /// Why it was excluded
        reason: String,
    },

    /// Job failed an attempt and went back to the queue
    Requeued {
        /// Job ID
        id: JobId,
        /// Retries used so far
        retry_count: u32,
        /// Error of the failed attempt
        error: String,
    },

    /// Job finished with final media in place
    Completed {
        /// Job ID
        id: JobId,
        /// Final path
        path: PathBuf,
    },

    /// Job failed terminally
    Failed {
        /// Job ID
        id: JobId,
        /// Error message
        error: String,
        /// Number of attempts made
        attempts: u32,
    },

    /// Job cancelled
    Cancelled {
        /// Job ID
        id: JobId,
    },

    /// Transcode task queued
    TranscodeQueued {
        /// Task ID
        task: TaskId,
        /// Owning job, if any
        job: Option<JobId>,
        /// Task origin
        origin: TranscodeOrigin,
    },

    /// Transcode task started encoding
    TranscodeStarted {
        /// Task ID
        task: TaskId,
    },

    /// Transcode progress
    TranscodeProgress {
        /// Task ID
        task: TaskId,
        /// Percentage, or None when the media duration is unknown
        percent: Option<f32>,
    },

    /// Transcode finished
    TranscodeCompleted {
        /// Task ID
        task: TaskId,
        /// Output path
        path: PathBuf,
    },

    /// Source already satisfied the target profile
    TranscodeSkipped {
        /// Task ID
        task: TaskId,
        /// Why no work was needed
        reason: String,
    },

    /// Transcode failed terminally
    TranscodeFailed {
        /// Task ID
        task: TaskId,
        /// Error message
        error: String,
    },

    /// Transcode cancelled
    TranscodeCancelled {
        /// Task ID
        task: TaskId,
    },

    /// Graceful shutdown initiated
    Shutdown,
}

impl Event {
    /// The job this event concerns, if any
    pub fn job_id(&self) -> Option<JobId> {
        match self {
            Event::Queued { id, .. }
            | Event::StageEntered { id, .. }
            | Event::Progress { id, .. }
            | Event::ProviderExcluded { id, .. }
            | Event::Requeued { id, .. }
            | Event::Completed { id, .. }
            | Event::Failed { id, .. }
            | Event::Cancelled { id } => Some(*id),
            Event::TranscodeQueued { job, .. } => *job,
            _ => None,
        }
    }

    /// Whether this event ends a job's lifecycle
    pub fn is_job_terminal(&self) -> bool {
        matches!(
            self,
            Event::Completed { .. } | Event::Failed { .. } | Event::Cancelled { .. }
        )
    }
}

/// Snapshot of a job
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobInfo {
    /// Job ID
    pub id: JobId,
    /// Display name
    pub name: String,
    /// Source kind
    pub source_kind: SourceKind,
    /// Current status
    pub status: JobStatus,
    /// Admission priority
    pub priority: Priority,
    /// Catalog reference
    pub catalog: Option<CatalogRef>,
    /// Expected total bytes
    pub total_bytes: u64,
    /// Bytes retrieved so far
    pub downloaded_bytes: u64,
    /// Working directory for temp artifacts
    pub temp_path: Option<PathBuf>,
    /// Final media path once completed
    pub final_path: Option<PathBuf>,
    /// Last recorded error
    pub error: Option<String>,
    /// Retries used
    pub retry_count: u32,
    /// When the job was enqueued
    pub created_at: DateTime<Utc>,
    /// When the current attempt started
    pub started_at: Option<DateTime<Utc>>,
    /// When the job reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobInfo {
    /// Progress percentage (0.0 to 100.0)
    pub fn percent(&self) -> f32 {
        if self.total_bytes == 0 {
            return if self.status == JobStatus::Completed {
                100.0
            } else {
                0.0
            };
        }
        (self.downloaded_bytes as f32 / self.total_bytes as f32 * 100.0).min(100.0)
    }
}

/// Snapshot of a transcode task
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeInfo {
    /// Task ID
    pub id: TaskId,
    /// Owning job, if any
    pub job_id: Option<JobId>,
    /// Input media
    pub source_path: PathBuf,
    /// Output media
    pub target_path: PathBuf,
    /// Current status
    pub status: TranscodeStatus,
    /// Admission priority
    pub priority: Priority,
    /// Known media duration in seconds
    pub duration_secs: Option<f64>,
    /// Task origin
    pub origin: TranscodeOrigin,
    /// Last recorded error
    pub error: Option<String>,
    /// Retries used
    pub retry_count: u32,
    /// When the task was created
    pub created_at: DateTime<Utc>,
    /// When encoding started
    pub started_at: Option<DateTime<Utc>>,
    /// When the task reached a terminal state
    pub completed_at: Option<DateTime<Utc>>,
}
