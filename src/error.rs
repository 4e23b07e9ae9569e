//! Error types for media-acquire
//!
//! - [`Error`] is the crate-wide error returned by public operations.
//! - [`JobError`] is the job-level failure taxonomy recorded on jobs.
//! - [`FetchError`] classifies a single article retrieval attempt.
//! - [`AcquireError`] is the outcome of waiting for a provider session.
//! - [`NzbError`] and [`YencError`] report malformed input.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for media-acquire operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for media-acquire
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "download.temp_dir")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// NNTP protocol or connection error
    #[error("NNTP error: {0}")]
    Nntp(String),

    /// Job-level pipeline failure
    #[error(transparent)]
    Job(#[from] JobError),

    /// Invalid NZB document
    #[error("invalid NZB: {0}")]
    InvalidNzb(#[from] NzbError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Job or task not found
    #[error("not found: {0}")]
    NotFound(String),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// HTTP source answered with a non-success status
    #[error("HTTP {status} from {url}")]
    HttpStatus {
        /// Response status code
        status: u16,
        /// Requested URL
        url: String,
    },

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Folder watching error
    #[error("folder watch error: {0}")]
    FolderWatch(String),

    /// An identical NZB is already queued or in progress
    #[error("duplicate job: {0}")]
    Duplicate(String),

    /// Wrong password for an encrypted archive
    #[error("wrong password for encrypted archive {archive}")]
    WrongPassword {
        /// The encrypted archive that could not be opened
        archive: PathBuf,
    },

    /// External tool execution failed (par2, ffmpeg, etc.)
    #[error("external tool error: {0}")]
    ExternalTool(String),

    /// Operation not supported (missing binary, not implemented, etc.)
    #[error("not supported: {0}")]
    NotSupported(String),

    /// Transcode failure
    #[error("transcode error: {0}")]
    Transcode(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),

    /// Record not found
    #[error("record not found: {0}")]
    NotFound(String),
}

/// Job-level failure taxonomy
///
/// Segment-level transient errors never escape a job as `TransientNetwork`
/// unless the HTTP path exhausted its retries.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    /// Network failure that outlived its retries
    #[error("transient network error: {0}")]
    TransientNetwork(String),

    /// Authentication or permanent provider failure
    #[error("provider {provider} failed permanently: {reason}")]
    ProtocolFatal {
        /// Provider name
        provider: String,
        /// Failure reported by the provider
        reason: String,
    },

    /// Segments missing from every eligible provider with no way to repair them
    #[error("{missing} segment(s) missing from all providers (first: {message_id})")]
    SegmentMissing {
        /// Number of failed segments
        missing: usize,
        /// First failed message-id
        message_id: String,
    },

    /// Reassembly size mismatch or failed repair
    #[error("integrity mismatch: {0}")]
    IntegrityMismatch(String),

    /// Archive could not be unpacked; pre-extraction files are retained
    #[error("extraction failed for {archive}: {reason}")]
    ExtractionFailure {
        /// Archive that failed
        archive: PathBuf,
        /// Why it failed
        reason: String,
    },

    /// User-initiated cancellation
    #[error("cancelled")]
    Cancelled,
}

impl JobError {
    /// Machine-readable code for the failure kind
    pub fn code(&self) -> &'static str {
        match self {
            JobError::TransientNetwork(_) => "transient_network",
            JobError::ProtocolFatal { .. } => "protocol_fatal",
            JobError::SegmentMissing { .. } => "segment_missing",
            JobError::IntegrityMismatch(_) => "integrity_mismatch",
            JobError::ExtractionFailure { .. } => "extraction_failure",
            JobError::Cancelled => "cancelled",
        }
    }

    /// Whether pre-extraction artifacts must survive this failure
    pub fn retains_artifacts(&self) -> bool {
        matches!(self, JobError::ExtractionFailure { .. })
    }
}

/// Outcome classification of one article retrieval attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    /// The provider does not have the article
    #[error("article {message_id} not found")]
    NotFound {
        /// Requested message-id
        message_id: String,
    },

    /// Timeout, reset or temporary server condition
    #[error("transient failure: {0}")]
    Transient(String),

    /// Authentication or permanent provider failure
    #[error("fatal provider failure: {0}")]
    Fatal(String),

    /// The body could not be decoded or failed its checksum
    #[error("corrupt article: {0}")]
    Corrupt(String),
}

impl FetchError {
    /// Whether the session that produced this error must be discarded
    pub fn breaks_session(&self) -> bool {
        matches!(self, FetchError::Transient(_) | FetchError::Fatal(_))
    }
}

impl From<YencError> for FetchError {
    fn from(e: YencError) -> Self {
        FetchError::Corrupt(e.to_string())
    }
}

/// Outcome of waiting for a provider session
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    /// No slot freed before the acquire timeout
    #[error("provider busy: no session available within timeout")]
    Busy,

    /// Provider is disabled, unknown, or could not establish a session
    #[error("provider unavailable: {reason}")]
    Unavailable {
        /// Why no session could be handed out
        reason: String,
        /// Disabled or rejected credentials; retrying within the job is pointless
        permanent: bool,
    },

    /// The waiting job was cancelled
    #[error("cancelled while waiting for a session")]
    Cancelled,
}

/// NZB parsing errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NzbError {
    /// Malformed XML
    #[error("malformed XML: {0}")]
    Xml(String),

    /// Document contains no file with segments
    #[error("document contains no downloadable files")]
    NoFiles,

    /// Required attribute absent or unparsable
    #[error("invalid {attribute} on <{element}>: {reason}")]
    InvalidAttribute {
        /// Element name
        element: &'static str,
        /// Attribute name
        attribute: &'static str,
        /// What was wrong
        reason: String,
    },

    /// A segment element with an empty message-id
    #[error("empty message-id in file {file_index} segment {segment_index}")]
    EmptyMessageId {
        /// File position in the document
        file_index: usize,
        /// Segment position in the file
        segment_index: usize,
    },
}

/// yEnc decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum YencError {
    /// No `=ybegin` line
    #[error("missing =ybegin header")]
    MissingHeader,

    /// No `=yend` line
    #[error("missing =yend trailer")]
    MissingTrailer,

    /// Header, part or trailer line could not be parsed
    #[error("malformed yEnc body: {0}")]
    Malformed(String),

    /// Decoded length disagrees with the declared part size
    #[error("decoded {actual} bytes but part declares {expected}")]
    SizeMismatch {
        /// Declared size
        expected: u64,
        /// Decoded size
        actual: u64,
    },

    /// CRC32 of decoded bytes disagrees with the trailer
    #[error("CRC mismatch: expected {expected:08x}, got {actual:08x}")]
    CrcMismatch {
        /// CRC from the trailer
        expected: u32,
        /// CRC of the decoded data
        actual: u32,
    },
}
