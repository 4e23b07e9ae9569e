//! Encoder capability used by the transcode queue

use crate::config::TargetProfile;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Stream and container facts about a media file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MediaProbe {
    /// Total duration, if the container reports one
    pub duration_secs: Option<f64>,
    /// Demuxer names, e.g. `["mov", "mp4", "m4a"]`
    pub formats: Vec<String>,
    /// Codec of the first video stream
    pub video_codec: Option<String>,
    /// Codec of the first audio stream
    pub audio_codec: Option<String>,
}

impl MediaProbe {
    /// Whether the file already matches `profile`
    ///
    /// Absent streams do not count against the profile: an audio-only file
    /// in the right container with the right audio codec is satisfied.
    pub fn satisfies(&self, profile: &TargetProfile) -> bool {
        let container = muxer_name(&profile.container);
        let container_ok = self
            .formats
            .iter()
            .any(|f| f.eq_ignore_ascii_case(container));
        let video_ok = self
            .video_codec
            .as_deref()
            .is_none_or(|c| c.eq_ignore_ascii_case(&profile.video_codec));
        let audio_ok = self
            .audio_codec
            .as_deref()
            .is_none_or(|c| c.eq_ignore_ascii_case(&profile.audio_codec));
        let has_stream = self.video_codec.is_some() || self.audio_codec.is_some();
        container_ok && has_stream && video_ok && audio_ok
    }

    /// Why no work is needed, for the skip event
    pub fn skip_reason(&self, profile: &TargetProfile) -> String {
        format!(
            "already {} with {}/{}",
            profile.container,
            self.video_codec.as_deref().unwrap_or("no video"),
            self.audio_codec.as_deref().unwrap_or("no audio")
        )
    }
}

/// Map a container name to the muxer ffmpeg uses for it
pub(crate) fn muxer_name(container: &str) -> &str {
    match container.to_ascii_lowercase().as_str() {
        "mkv" => "matroska",
        "ts" | "m2ts" | "mts" => "mpegts",
        "m4v" => "mp4",
        _ => container,
    }
}

/// Receives the encoded position as the encoder advances
pub type EncodeProgress<'a> = &'a (dyn Fn(Duration) + Send + Sync);

/// Converts media into a target profile
///
/// The queue probes first and only calls `encode` when the source does not
/// already satisfy the profile.
#[async_trait]
pub trait MediaEncoder: Send + Sync {
    /// Inspect `source`
    async fn probe(&self, source: &Path) -> Result<MediaProbe>;

    /// Encode `source` into `target`
    ///
    /// Must stop promptly and return `JobError::Cancelled` once `cancel` fires.
    async fn encode(
        &self,
        source: &Path,
        target: &Path,
        profile: &TargetProfile,
        progress: EncodeProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()>;

    /// Get the name of this encoder
    fn name(&self) -> &'static str;
}
