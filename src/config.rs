//! Configuration types for media-acquire

use crate::types::Priority;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, path::PathBuf, time::Duration};

/// Main configuration for [`DownloadManager`](crate::DownloadManager)
///
/// Every section has defaults, so an empty document deserializes to a usable
/// configuration (without providers, which only HTTP jobs can run with).
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    /// Usenet providers, tried in ascending `priority` order
    #[serde(default)]
    pub providers: Vec<ProviderConfig>,

    /// Job queue, directories and segment retrieval settings
    #[serde(default)]
    pub download: DownloadConfig,

    /// Direct HTTP download settings
    #[serde(default)]
    pub http: HttpConfig,

    /// Transcode queue settings
    #[serde(default)]
    pub transcode: TranscodeConfig,

    /// External tool paths and password handling
    #[serde(default)]
    pub tools: ToolsConfig,

    /// Database location
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Directories scanned for media that only needs transcoding
    #[serde(default)]
    pub watch_folders: Vec<WatchFolderConfig>,
}

impl Config {
    /// Check invariants that serde defaults cannot express
    pub fn validate(&self) -> Result<()> {
        if self.download.max_concurrent_jobs == 0 {
            return Err(Error::Config {
                message: "max_concurrent_jobs must be at least 1".to_string(),
                key: Some("download.max_concurrent_jobs".to_string()),
            });
        }
        if self.transcode.max_concurrent == 0 {
            return Err(Error::Config {
                message: "transcode max_concurrent must be at least 1".to_string(),
                key: Some("transcode.max_concurrent".to_string()),
            });
        }

        let mut names = HashSet::new();
        for provider in &self.providers {
            if !names.insert(provider.name.as_str()) {
                return Err(Error::Config {
                    message: format!("duplicate provider name '{}'", provider.name),
                    key: Some("providers".to_string()),
                });
            }
            if provider.connections == 0 {
                return Err(Error::Config {
                    message: format!("provider '{}' has a connection limit of 0", provider.name),
                    key: Some("providers.connections".to_string()),
                });
            }
        }
        Ok(())
    }
}

/// Usenet provider configuration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Unique provider name, used as its identifier
    pub name: String,

    /// Server hostname
    pub host: String,

    /// Server port (typically 119 for unencrypted, 563 for TLS)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Use TLS (implicit TLS, not STARTTLS)
    #[serde(default = "default_true")]
    pub tls: bool,

    /// Username for authentication
    #[serde(default)]
    pub username: Option<String>,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Maximum concurrent sessions (default: 10)
    #[serde(default = "default_connections")]
    pub connections: usize,

    /// Provider priority (lower = tried first)
    #[serde(default)]
    pub priority: i32,

    /// Disabled providers are never tried
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Article retention in days (None = unknown)
    #[serde(default)]
    pub retention_days: Option<u32>,
}

impl ProviderConfig {
    /// Provider with default port, TLS and connection count
    pub fn new(name: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port: default_port(),
            tls: true,
            username: None,
            password: None,
            connections: default_connections(),
            priority: 0,
            enabled: true,
            retention_days: None,
        }
    }
}

impl From<&ProviderConfig> for nntp_rs::ServerConfig {
    fn from(config: &ProviderConfig) -> Self {
        nntp_rs::ServerConfig {
            host: config.host.clone(),
            port: config.port,
            tls: config.tls,
            allow_insecure_tls: false,
            username: config.username.clone().unwrap_or_default(),
            password: config.password.clone().unwrap_or_default(),
        }
    }
}

/// Job queue, directories and segment retrieval settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Final media directory (default: "./downloads")
    #[serde(default = "default_download_dir")]
    pub download_dir: PathBuf,

    /// Temporary directory for in-progress artifacts (default: "./temp")
    #[serde(default = "default_temp_dir")]
    pub temp_dir: PathBuf,

    /// Maximum jobs actively downloading at once (default: 3)
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_jobs: usize,

    /// Requeues allowed before a job fails terminally (default: 3)
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// How long a segment fetch waits for a provider session (default: 30 seconds)
    #[serde(default = "default_acquire_timeout", with = "duration_serde")]
    pub acquire_timeout: Duration,

    /// Upper bound for a single article retrieval (default: 60 seconds)
    #[serde(default = "default_fetch_timeout", with = "duration_serde")]
    pub fetch_timeout: Duration,

    /// How long `cancel` waits for the job to acknowledge (default: 10 seconds)
    #[serde(default = "default_cancel_timeout", with = "duration_serde")]
    pub cancel_timeout: Duration,

    /// Interval between progress events (default: 500 milliseconds)
    #[serde(default = "default_progress_interval", with = "millis_serde")]
    pub progress_interval: Duration,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            download_dir: default_download_dir(),
            temp_dir: default_temp_dir(),
            max_concurrent_jobs: default_max_concurrent(),
            max_retries: default_max_retries(),
            acquire_timeout: default_acquire_timeout(),
            fetch_timeout: default_fetch_timeout(),
            cancel_timeout: default_cancel_timeout(),
            progress_interval: default_progress_interval(),
        }
    }
}

/// Direct HTTP download settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Playback simulation caps the rate at this multiple of the bitrate (default: 1.5)
    #[serde(default = "default_playback_multiplier")]
    pub playback_multiplier: f64,

    /// Bitrate assumed when a source does not declare one (default: 8 Mbit/s)
    #[serde(default = "default_bitrate")]
    pub default_bitrate_bps: u64,

    /// Connect and idle-read timeout (default: 30 seconds)
    #[serde(default = "default_request_timeout", with = "duration_serde")]
    pub request_timeout: Duration,

    /// User-Agent header sent with requests
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Retry policy for transient HTTP failures
    #[serde(default)]
    pub retry: RetryConfig,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            playback_multiplier: default_playback_multiplier(),
            default_bitrate_bps: default_bitrate(),
            request_timeout: default_request_timeout(),
            user_agent: default_user_agent(),
            retry: RetryConfig::default(),
        }
    }
}

/// Retry configuration for transient failures
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (default: 5)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay before first retry (default: 1 second)
    #[serde(default = "default_initial_delay", with = "duration_serde")]
    pub initial_delay: Duration,

    /// Maximum delay between retries (default: 60 seconds)
    #[serde(default = "default_max_delay", with = "duration_serde")]
    pub max_delay: Duration,

    /// Multiplier for exponential backoff (default: 2.0)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Add random jitter to delays (default: true)
    #[serde(default = "default_true")]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay: default_initial_delay(),
            max_delay: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: true,
        }
    }
}

/// Transcode queue settings
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TranscodeConfig {
    /// Hand finished downloads to the transcode queue (default: true)
    ///
    /// When no ffmpeg binary can be found the queue still accepts tasks but the
    /// manager completes jobs without a transcode handoff.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to ffmpeg (auto-detected if None)
    #[serde(default)]
    pub ffmpeg_path: Option<PathBuf>,

    /// Path to ffprobe (auto-detected if None)
    #[serde(default)]
    pub ffprobe_path: Option<PathBuf>,

    /// Maximum concurrent encodes (default: 1)
    #[serde(default = "default_transcode_concurrency")]
    pub max_concurrent: usize,

    /// Requeues allowed before a task fails terminally (default: 1)
    #[serde(default = "default_transcode_retries")]
    pub max_retries: u32,

    /// Output format
    #[serde(default)]
    pub target: TargetProfile,

    /// Hardware encoder to use (None = software)
    #[serde(default)]
    pub hardware_accel: Option<HardwareAccel>,

    /// Render node for VAAPI (default: "/dev/dri/renderD128")
    #[serde(default = "default_vaapi_device")]
    pub vaapi_device: PathBuf,

    /// Remove the source once the output is in place (default: false)
    #[serde(default)]
    pub delete_source: bool,

    /// How long terminal tasks are kept before purging (default: 7 days)
    #[serde(default = "default_task_retention", with = "duration_serde")]
    pub task_retention: Duration,
}

impl Default for TranscodeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ffmpeg_path: None,
            ffprobe_path: None,
            max_concurrent: default_transcode_concurrency(),
            max_retries: default_transcode_retries(),
            target: TargetProfile::default(),
            hardware_accel: None,
            vaapi_device: default_vaapi_device(),
            delete_source: false,
            task_retention: default_task_retention(),
        }
    }
}

/// Container and codecs a transcode produces
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetProfile {
    /// Container / file extension (default: "mp4")
    #[serde(default = "default_container")]
    pub container: String,

    /// Video codec name as reported by ffprobe (default: "h264")
    #[serde(default = "default_video_codec")]
    pub video_codec: String,

    /// Audio codec name as reported by ffprobe (default: "aac")
    #[serde(default = "default_audio_codec")]
    pub audio_codec: String,
}

impl Default for TargetProfile {
    fn default() -> Self {
        Self {
            container: default_container(),
            video_codec: default_video_codec(),
            audio_codec: default_audio_codec(),
        }
    }
}

/// Hardware video encoder families
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HardwareAccel {
    /// NVIDIA NVENC
    Nvenc,
    /// VA-API (Intel/AMD on Linux)
    Vaapi,
    /// Intel Quick Sync
    Qsv,
    /// Apple VideoToolbox
    VideoToolbox,
}

/// External tool paths and password handling
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ToolsConfig {
    /// Path to par2 executable (auto-detected if None)
    #[serde(default)]
    pub par2_path: Option<PathBuf>,

    /// Whether to search PATH for external binaries if explicit paths not set (default: true)
    #[serde(default = "default_true")]
    pub search_path: bool,

    /// Try empty password as fallback when extracting (default: true)
    #[serde(default = "default_true")]
    pub try_empty_password: bool,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            par2_path: None,
            search_path: true,
            try_empty_password: true,
        }
    }
}

/// Database location
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Database path (default: "./media-acquire.db")
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            database_path: default_database_path(),
        }
    }
}

/// Watch folder configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WatchFolderConfig {
    /// Directory to watch for media files
    pub path: PathBuf,

    /// Priority of created transcode tasks
    #[serde(default)]
    pub priority: Priority,

    /// How long a file's size must stay unchanged before intake (default: 5 seconds)
    #[serde(default = "default_settle_interval", with = "duration_serde")]
    pub settle_interval: Duration,
}

fn default_download_dir() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_temp_dir() -> PathBuf {
    PathBuf::from("temp")
}

fn default_database_path() -> PathBuf {
    PathBuf::from("media-acquire.db")
}

fn default_max_concurrent() -> usize {
    3
}

fn default_max_retries() -> u32 {
    3
}

fn default_port() -> u16 {
    563
}

fn default_connections() -> usize {
    10
}

fn default_true() -> bool {
    true
}

fn default_acquire_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_fetch_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_cancel_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_progress_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_playback_multiplier() -> f64 {
    1.5
}

fn default_bitrate() -> u64 {
    8_000_000
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_user_agent() -> String {
    format!("media-acquire/{}", env!("CARGO_PKG_VERSION"))
}

fn default_max_attempts() -> u32 {
    5
}

fn default_initial_delay() -> Duration {
    Duration::from_secs(1)
}

fn default_max_delay() -> Duration {
    Duration::from_secs(60)
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_transcode_concurrency() -> usize {
    1
}

fn default_transcode_retries() -> u32 {
    1
}

fn default_vaapi_device() -> PathBuf {
    PathBuf::from("/dev/dri/renderD128")
}

fn default_task_retention() -> Duration {
    Duration::from_secs(7 * 24 * 60 * 60)
}

fn default_container() -> String {
    "mp4".to_string()
}

fn default_video_codec() -> String {
    "h264".to_string()
}

fn default_audio_codec() -> String {
    "aac".to_string()
}

fn default_settle_interval() -> Duration {
    Duration::from_secs(5)
}

// Duration serialization helper
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

// Millisecond Duration serialization helper
mod millis_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
