//! NZB documents and the segment plan derived from them
//!
//! [`parse`] turns an NZB document into an [`NzbPlan`]: files in document order,
//! each with its segments in the order they were authored. That order is the only
//! assembly key; nothing downstream may reorder it.

mod classify;
mod parser;

pub use classify::{classify, filename_from_subject};
pub use parser::parse;

use serde::{Deserialize, Serialize};

/// Metadata from the NZB `<head>` section
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NzbMeta {
    /// `<meta type="title">`
    pub title: Option<String>,
    /// `<meta type="password">`, used for encrypted archives
    pub password: Option<String>,
    /// `<meta type="category">`
    pub category: Option<String>,
}

/// Role a file plays in the job
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileKind {
    /// Playable media
    Media,
    /// Archive volume containing the payload
    Archive,
    /// PAR2 index file
    ParIndex,
    /// PAR2 recovery volume
    ParVolume {
        /// First recovery block in this volume
        block_offset: u32,
        /// Number of recovery blocks in this volume
        block_count: u32,
    },
    /// Anything else (nfo, sfv, samples, subtitles)
    Other,
}

impl FileKind {
    /// Whether this file carries redundancy data
    pub fn is_repair(&self) -> bool {
        matches!(self, FileKind::ParIndex | FileKind::ParVolume { .. })
    }

    /// Whether this file is part of the payload handed to extraction
    pub fn is_payload(&self) -> bool {
        !self.is_repair()
    }
}

/// One article of a file
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Segment {
    /// Position of the owning file in the plan
    pub file_index: usize,
    /// Position of this segment in its file, as authored
    pub segment_index: usize,
    /// `number` attribute from the document
    pub number: u32,
    /// Article message-id without angle brackets
    pub message_id: String,
    /// Declared size in bytes
    pub bytes: u64,
}

/// One file of the plan
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NzbFile {
    /// Position in the plan
    pub index: usize,
    /// Subject line
    pub subject: String,
    /// Poster
    pub poster: String,
    /// Post date (unix seconds)
    pub date: i64,
    /// Newsgroups the file was posted to
    pub groups: Vec<String>,
    /// Filename derived from the subject
    pub filename: String,
    /// Classification
    pub kind: FileKind,
    /// Segments in authored order
    pub segments: Vec<Segment>,
}

impl NzbFile {
    /// Sum of declared segment sizes
    pub fn declared_size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }
}

/// Parsed NZB document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NzbPlan {
    /// Head metadata
    pub meta: NzbMeta,
    /// Files with at least one segment, in document order
    pub files: Vec<NzbFile>,
}

impl NzbPlan {
    /// Sum of all declared segment sizes
    pub fn total_bytes(&self) -> u64 {
        self.files.iter().map(NzbFile::declared_size).sum()
    }

    /// Number of segments across all files
    pub fn segment_count(&self) -> usize {
        self.files.iter().map(|f| f.segments.len()).sum()
    }

    /// All segments, file by file, in authored order
    pub fn segments(&self) -> impl Iterator<Item = &Segment> {
        self.files.iter().flat_map(|f| f.segments.iter())
    }

    /// Whether any redundancy data is present
    pub fn has_repair_data(&self) -> bool {
        self.files.iter().any(|f| f.kind.is_repair())
    }

    /// Name used for the job when none was given
    pub fn display_name(&self) -> Option<String> {
        self.meta.title.clone().or_else(|| {
            self.files
                .iter()
                .find(|f| f.kind.is_payload())
                .map(|f| strip_extension(&f.filename))
        })
    }
}

fn strip_extension(filename: &str) -> String {
    match filename.rsplit_once('.') {
        Some((stem, _)) if !stem.is_empty() => stem.to_string(),
        _ => filename.to_string(),
    }
}
