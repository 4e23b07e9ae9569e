//! Filename extraction and file classification

use super::FileKind;
use regex::Regex;
use std::sync::LazyLock;

static QUOTED_FILENAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#""([^"]+\.[a-zA-Z0-9]{2,4})""#).ok());

static BARE_FILENAME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"([^\s/\\]+\.[a-zA-Z0-9]{2,4})\s+yEnc").ok());

static PAR2_VOLUME: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.vol(\d+)\+(\d+)\.par2$").ok());

static SPLIT_ARCHIVE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.(r\d{2}|\d{3})$").ok());

const MEDIA_EXTENSIONS: &[&str] = &[
    "mkv", "mp4", "m4v", "avi", "mov", "wmv", "ts", "m2ts", "mts", "mpg", "mpeg", "webm",
    "flv", "vob",
];

const ARCHIVE_EXTENSIONS: &[&str] = &["rar", "7z", "zip"];

/// Extract the posted filename from a subject line
///
/// Prefers the last quoted name (`... "name.ext" yEnc (1/50)`), then a bare name
/// right before `yEnc`, then a sanitised subject with the file's index.
pub fn filename_from_subject(subject: &str, index: usize) -> String {
    let quoted = QUOTED_FILENAME
        .as_ref()
        .and_then(|re| re.captures_iter(subject).last())
        .map(|cap| cap[1].to_string());
    let bare = || {
        BARE_FILENAME
            .as_ref()
            .and_then(|re| re.captures(subject))
            .map(|cap| cap[1].to_string())
    };

    quoted
        .or_else(bare)
        .map(|name| crate::utils::sanitize_filename(&name))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| format!("file_{index:03}"))
}

/// Classify a file by its extension
pub fn classify(filename: &str) -> FileKind {
    let lower = filename.to_ascii_lowercase();

    if lower.ends_with(".par2") {
        return PAR2_VOLUME
            .as_ref()
            .and_then(|re| re.captures(filename))
            .map(|caps| FileKind::ParVolume {
                block_offset: caps[1].parse().unwrap_or(0),
                block_count: caps[2].parse().unwrap_or(0),
            })
            .unwrap_or(FileKind::ParIndex);
    }

    let extension = lower.rsplit_once('.').map(|(_, ext)| ext).unwrap_or("");
    if ARCHIVE_EXTENSIONS.contains(&extension)
        || SPLIT_ARCHIVE
            .as_ref()
            .is_some_and(|re| re.is_match(&lower))
    {
        return FileKind::Archive;
    }
    if MEDIA_EXTENSIONS.contains(&extension) {
        return FileKind::Media;
    }
    FileKind::Other
}
