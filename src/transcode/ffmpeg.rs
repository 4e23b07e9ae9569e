//! ffmpeg/ffprobe-backed encoder

use super::encoder::{EncodeProgress, MediaEncoder, MediaProbe, muxer_name};
use crate::config::{HardwareAccel, TargetProfile, TranscodeConfig};
use crate::error::{Error, JobError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

/// Lines of ffmpeg stderr kept for the failure message
const STDERR_TAIL: usize = 8;

/// Runs external `ffprobe` and `ffmpeg` binaries
#[derive(Debug, Clone)]
pub struct FfmpegEncoder {
    ffmpeg_path: PathBuf,
    ffprobe_path: PathBuf,
    hardware_accel: Option<HardwareAccel>,
    vaapi_device: PathBuf,
}

impl FfmpegEncoder {
    /// Software encoder using the given binaries
    pub fn new(ffmpeg_path: PathBuf, ffprobe_path: PathBuf) -> Self {
        Self {
            ffmpeg_path,
            ffprobe_path,
            hardware_accel: None,
            vaapi_device: PathBuf::from("/dev/dri/renderD128"),
        }
    }

    /// Encoder for the configured binaries, falling back to PATH when allowed
    ///
    /// Returns `None` when either binary cannot be located.
    pub fn from_config(config: &TranscodeConfig, search_path: bool) -> Option<Self> {
        let locate = |configured: &Option<PathBuf>, name: &str| match configured {
            Some(path) => Some(path.clone()),
            None if search_path => which::which(name).ok(),
            None => None,
        };
        let ffmpeg = locate(&config.ffmpeg_path, "ffmpeg")?;
        let ffprobe = locate(&config.ffprobe_path, "ffprobe")?;

        Some(Self {
            hardware_accel: config.hardware_accel,
            vaapi_device: config.vaapi_device.clone(),
            ..Self::new(ffmpeg, ffprobe)
        })
    }

    /// Use a hardware encoder family
    pub fn with_hardware_accel(mut self, accel: HardwareAccel) -> Self {
        self.hardware_accel = Some(accel);
        self
    }

    /// Build ffmpeg arguments for one encode
    pub(crate) fn build_args(&self, source: &Path, target: &Path, profile: &TargetProfile) -> Vec<String> {
        let mut args: Vec<String> = ["-y", "-hide_banner", "-nostats", "-loglevel", "error"]
            .into_iter()
            .map(String::from)
            .collect();
        args.extend(["-progress".to_string(), "pipe:1".to_string()]);

        if self.hardware_accel == Some(HardwareAccel::Vaapi) {
            args.extend([
                "-vaapi_device".to_string(),
                self.vaapi_device.to_string_lossy().into_owned(),
            ]);
        }

        args.extend(["-i".to_string(), source.to_string_lossy().into_owned()]);
        args.extend(["-map".to_string(), "0:v:0?".to_string()]);
        args.extend(["-map".to_string(), "0:a:0?".to_string()]);

        if self.hardware_accel == Some(HardwareAccel::Vaapi) {
            args.extend(["-vf".to_string(), "format=nv12,hwupload".to_string()]);
        }
        let video_encoder = video_encoder(&profile.video_codec, self.hardware_accel);
        let software = video_encoder.starts_with("libx26");
        args.extend(["-c:v".to_string(), video_encoder]);
        if software {
            args.extend(["-preset".to_string(), "veryfast".to_string()]);
            args.extend(["-crf".to_string(), "23".to_string()]);
        }

        args.extend(["-c:a".to_string(), profile.audio_codec.clone()]);

        let muxer = muxer_name(&profile.container);
        if muxer == "mp4" {
            args.extend(["-movflags".to_string(), "+faststart".to_string()]);
        }
        args.extend(["-f".to_string(), muxer.to_string()]);
        args.push(target.to_string_lossy().into_owned());
        args
    }
}

/// Encoder name for a codec on the selected hardware
fn video_encoder(codec: &str, accel: Option<HardwareAccel>) -> String {
    let family = match codec.to_ascii_lowercase().as_str() {
        "h264" | "avc" => "h264",
        "hevc" | "h265" => "hevc",
        other => return other.to_string(),
    };
    match accel {
        Some(HardwareAccel::Nvenc) => format!("{family}_nvenc"),
        Some(HardwareAccel::Vaapi) => format!("{family}_vaapi"),
        Some(HardwareAccel::Qsv) => format!("{family}_qsv"),
        Some(HardwareAccel::VideoToolbox) => format!("{family}_videotoolbox"),
        None if family == "h264" => "libx264".to_string(),
        None => "libx265".to_string(),
    }
}

/// Encoded position from one `-progress` line
///
/// ffmpeg reports both `out_time_us` and `out_time_ms`; both are microseconds.
pub(crate) fn parse_progress_line(line: &str) -> Option<Duration> {
    let (key, value) = line.trim().split_once('=')?;
    match key {
        "out_time_us" | "out_time_ms" => value.parse::<u64>().ok().map(Duration::from_micros),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    #[serde(default)]
    format: Option<ProbeFormat>,
    #[serde(default)]
    streams: Vec<ProbeStream>,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    #[serde(default)]
    format_name: Option<String>,
    #[serde(default)]
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProbeStream {
    #[serde(default)]
    codec_type: Option<String>,
    #[serde(default)]
    codec_name: Option<String>,
}

/// Interpret `ffprobe -of json` output
pub(crate) fn parse_probe_output(json: &[u8]) -> Result<MediaProbe> {
    let output: ProbeOutput = serde_json::from_slice(json)?;
    let first_codec = |kind: &str| {
        output
            .streams
            .iter()
            .find(|s| s.codec_type.as_deref() == Some(kind))
            .and_then(|s| s.codec_name.clone())
    };

    let (formats, duration_secs) = match &output.format {
        Some(format) => (
            format
                .format_name
                .as_deref()
                .map(|names| names.split(',').map(str::to_string).collect())
                .unwrap_or_default(),
            format
                .duration
                .as_deref()
                .and_then(|d| d.parse::<f64>().ok())
                .filter(|d| d.is_finite() && *d > 0.0),
        ),
        None => (Vec::new(), None),
    };

    Ok(MediaProbe {
        duration_secs,
        formats,
        video_codec: first_codec("video"),
        audio_codec: first_codec("audio"),
    })
}

#[async_trait]
impl MediaEncoder for FfmpegEncoder {
    async fn probe(&self, source: &Path) -> Result<MediaProbe> {
        let output = Command::new(&self.ffprobe_path)
            .args(["-v", "error"])
            .args(["-show_entries", "format=format_name,duration:stream=codec_type,codec_name"])
            .args(["-of", "json"])
            .arg(source)
            .output()
            .await
            .map_err(|e| Error::ExternalTool(format!("failed to execute ffprobe: {e}")))?;

        if !output.status.success() {
            return Err(Error::Transcode(format!(
                "ffprobe failed on {}: {}",
                source.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        parse_probe_output(&output.stdout)
    }

    async fn encode(
        &self,
        source: &Path,
        target: &Path,
        profile: &TargetProfile,
        progress: EncodeProgress<'_>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let args = self.build_args(source, target, profile);
        tracing::debug!(ffmpeg = %self.ffmpeg_path.display(), ?args, "Starting encode");

        let mut child = Command::new(&self.ffmpeg_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::ExternalTool(format!("failed to execute ffmpeg: {e}")))?;

        let stderr_task = child.stderr.take().map(|stderr| {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                let mut tail = std::collections::VecDeque::with_capacity(STDERR_TAIL);
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!("ffmpeg: {}", line);
                    if tail.len() == STDERR_TAIL {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Vec::from(tail).join("\n")
            })
        });

        if let Some(stdout) = child.stdout.take() {
            let mut lines = BufReader::new(stdout).lines();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = child.kill().await;
                        let _ = tokio::fs::remove_file(target).await;
                        return Err(JobError::Cancelled.into());
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if let Some(position) = parse_progress_line(&line) {
                                progress(position);
                            }
                        }
                        Ok(None) | Err(_) => break,
                    },
                }
            }
        }

        let exited = tokio::select! {
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };
        let Some(status) = exited else {
            let _ = child.kill().await;
            let _ = tokio::fs::remove_file(target).await;
            return Err(JobError::Cancelled.into());
        };
        let status =
            status.map_err(|e| Error::ExternalTool(format!("failed to wait for ffmpeg: {e}")))?;

        if status.success() {
            return Ok(());
        }

        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let _ = tokio::fs::remove_file(target).await;
        Err(Error::Transcode(format!(
            "ffmpeg exited with {status}: {}",
            stderr.trim()
        )))
    }

    fn name(&self) -> &'static str {
        "ffmpeg"
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    fn encoder() -> FfmpegEncoder {
        FfmpegEncoder::new(PathBuf::from("ffmpeg"), PathBuf::from("ffprobe"))
    }

    fn value_after<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .and_then(|i| args.get(i + 1))
            .map(String::as_str)
    }

    #[test]
    fn software_args_use_libx264_and_report_progress() {
        let args = encoder().build_args(
            Path::new("/in/movie.mkv"),
            Path::new("/out/movie.mp4"),
            &TargetProfile::default(),
        );
        assert_eq!(value_after(&args, "-progress"), Some("pipe:1"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx264"));
        assert_eq!(value_after(&args, "-c:a"), Some("aac"));
        assert_eq!(value_after(&args, "-f"), Some("mp4"));
        assert_eq!(args.last().map(String::as_str), Some("/out/movie.mp4"));
    }

    #[test]
    fn hardware_families_select_their_encoders() {
        let profile = TargetProfile::default();
        for (accel, expected) in [
            (HardwareAccel::Nvenc, "h264_nvenc"),
            (HardwareAccel::Qsv, "h264_qsv"),
            (HardwareAccel::VideoToolbox, "h264_videotoolbox"),
        ] {
            let args = encoder().with_hardware_accel(accel).build_args(
                Path::new("a.mkv"),
                Path::new("a.mp4"),
                &profile,
            );
            assert_eq!(value_after(&args, "-c:v"), Some(expected));
            assert!(!args.contains(&"-crf".to_string()));
        }
    }

    #[test]
    fn vaapi_names_its_device_before_the_input() {
        let args = encoder()
            .with_hardware_accel(HardwareAccel::Vaapi)
            .build_args(Path::new("a.mkv"), Path::new("a.mp4"), &TargetProfile::default());
        let device = args.iter().position(|a| a == "-vaapi_device").unwrap();
        let input = args.iter().position(|a| a == "-i").unwrap();
        assert!(device < input);
        assert_eq!(value_after(&args, "-c:v"), Some("h264_vaapi"));
        assert_eq!(value_after(&args, "-vf"), Some("format=nv12,hwupload"));
    }

    #[test]
    fn mkv_target_uses_matroska_muxer() {
        let profile = TargetProfile {
            container: "mkv".into(),
            video_codec: "hevc".into(),
            audio_codec: "opus".into(),
        };
        let args = encoder().build_args(Path::new("a.ts"), Path::new("a.mkv"), &profile);
        assert_eq!(value_after(&args, "-f"), Some("matroska"));
        assert_eq!(value_after(&args, "-c:v"), Some("libx265"));
        assert!(!args.contains(&"-movflags".to_string()));
    }

    #[test]
    fn progress_lines_are_microseconds() {
        assert_eq!(
            parse_progress_line("out_time_us=2500000"),
            Some(Duration::from_millis(2500))
        );
        assert_eq!(
            parse_progress_line("out_time_ms=1000000\n"),
            Some(Duration::from_secs(1))
        );
        assert_eq!(parse_progress_line("out_time=00:00:01.000000"), None);
        assert_eq!(parse_progress_line("out_time_us=N/A"), None);
        assert_eq!(parse_progress_line("progress=continue"), None);
    }

    #[test]
    fn probe_output_yields_first_streams_and_duration() {
        let json = br#"{
            "streams": [
                {"codec_type": "video", "codec_name": "hevc"},
                {"codec_type": "audio", "codec_name": "ac3"},
                {"codec_type": "audio", "codec_name": "aac"}
            ],
            "format": {"format_name": "matroska,webm", "duration": "5400.250000"}
        }"#;
        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.formats, vec!["matroska", "webm"]);
        assert_eq!(probe.video_codec.as_deref(), Some("hevc"));
        assert_eq!(probe.audio_codec.as_deref(), Some("ac3"));
        assert!((probe.duration_secs.unwrap() - 5400.25).abs() < 1e-6);
    }

    #[test]
    fn probe_without_duration_is_indeterminate() {
        let json = br#"{"streams": [], "format": {"format_name": "mpegts", "duration": "N/A"}}"#;
        let probe = parse_probe_output(json).unwrap();
        assert_eq!(probe.duration_secs, None);
        assert_eq!(probe.video_codec, None);
    }

    #[test]
    fn from_config_prefers_explicit_paths() {
        let config = TranscodeConfig {
            ffmpeg_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffmpeg")),
            ffprobe_path: Some(PathBuf::from("/opt/ffmpeg/bin/ffprobe")),
            hardware_accel: Some(HardwareAccel::Nvenc),
            ..Default::default()
        };
        let encoder = FfmpegEncoder::from_config(&config, false).unwrap();
        assert_eq!(encoder.ffmpeg_path, PathBuf::from("/opt/ffmpeg/bin/ffmpeg"));
        assert_eq!(encoder.hardware_accel, Some(HardwareAccel::Nvenc));
    }

    #[test]
    fn from_config_without_paths_or_search_is_none() {
        assert!(FfmpegEncoder::from_config(&TranscodeConfig::default(), false).is_none());
    }
}
