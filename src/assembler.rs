//! File reassembly from spooled segments
//!
//! Each decoded part carries its position within the file from its `=ypart`
//! line. Parts are written at those offsets into a file sized to the
//! encoder-declared length, so a missing part leaves a hole of exactly its own
//! length for repair to fill.

use crate::error::{JobError, Result};
use crate::nzb::NzbFile;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

/// Decoded bytes of one segment, spooled to disk
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpooledPart {
    /// Spool file holding the decoded bytes
    pub path: PathBuf,
    /// Zero-based position of the bytes within the file
    pub offset: u64,
}

/// Region of an assembled file with no data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gap {
    /// Segment position within the file
    pub segment_index: usize,
    /// Byte offset of the gap
    pub offset: u64,
    /// Zero-filled length
    pub len: u64,
}

/// A reassembled file
#[derive(Debug, Clone)]
pub struct AssembledFile {
    /// Where the file was written
    pub path: PathBuf,
    /// Size of the written file
    pub size: u64,
    /// Segments that were not available, left zero-filled
    pub gaps: Vec<Gap>,
}

impl AssembledFile {
    /// Whether every segment was present
    pub fn is_complete(&self) -> bool {
        self.gaps.is_empty()
    }
}

/// Joins the segments of one file in authored order
#[derive(Debug, Default, Clone, Copy)]
pub struct Reassembler;

impl Reassembler {
    /// Write `parts` (one entry per segment of `file`, `None` for a failed
    /// segment) at their offsets into `dest`
    ///
    /// The output is written next to `dest` and renamed into place once
    /// complete. `file_size` is the encoder-declared length; without it the
    /// file ends after the last part. When every segment is present the parts
    /// must tile the file exactly, and its size must equal `file_size` (or the
    /// sum of declared segment sizes when unknown).
    pub async fn assemble(
        &self,
        file: &NzbFile,
        parts: &[Option<SpooledPart>],
        file_size: Option<u64>,
        dest: &Path,
    ) -> Result<AssembledFile> {
        if parts.len() != file.segments.len() {
            return Err(mismatch(format!(
                "{}: {} segment slots for {} segments",
                file.filename,
                parts.len(),
                file.segments.len()
            )));
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let staging = staging_path(dest);
        let result = write_parts(file, parts, file_size, &staging).await;
        let (size, gaps) = match result {
            Ok(written) => written,
            Err(e) => {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&staging, dest).await?;

        if !gaps.is_empty() {
            tracing::warn!(
                file = %file.filename,
                gaps = gaps.len(),
                "File reassembled with missing segments"
            );
        }

        Ok(AssembledFile {
            path: dest.to_path_buf(),
            size,
            gaps,
        })
    }
}

async fn write_parts(
    file: &NzbFile,
    parts: &[Option<SpooledPart>],
    file_size: Option<u64>,
    staging: &Path,
) -> Result<(u64, Vec<Gap>)> {
    let mut out = tokio::fs::File::create(staging).await?;
    if let Some(size) = file_size {
        out.set_len(size).await?;
    }

    // (offset, len) per present slot
    let mut placed: Vec<Option<(u64, u64)>> = Vec::with_capacity(parts.len());
    for part in parts {
        let Some(part) = part else {
            placed.push(None);
            continue;
        };
        let bytes = tokio::fs::read(&part.path).await?;
        let len = bytes.len() as u64;
        if let Some(size) = file_size
            && part.offset + len > size
        {
            return Err(mismatch(format!(
                "{}: part at {}..{} extends past the {} byte file",
                file.filename,
                part.offset,
                part.offset + len,
                size
            )));
        }
        out.seek(SeekFrom::Start(part.offset)).await?;
        out.write_all(&bytes).await?;
        placed.push(Some((part.offset, len)));
    }

    let typical = placed.iter().flatten().map(|&(_, len)| len).max();
    let mut gaps = Vec::new();
    let mut cursor = 0u64;
    let mut contiguous = true;
    let mut index = 0;
    while index < placed.len() {
        if let Some((offset, len)) = placed[index] {
            contiguous &= offset == cursor;
            cursor = offset + len;
            index += 1;
            continue;
        }

        let run_start = index;
        while index < placed.len() && placed[index].is_none() {
            index += 1;
        }
        let run = &file.segments[run_start..index];
        let span_end = match placed.get(index).copied().flatten() {
            Some((offset, _)) => offset,
            None => file_size.unwrap_or_else(|| cursor + run.iter().map(|s| s.bytes).sum::<u64>()),
        };
        let mut remaining = span_end.saturating_sub(cursor);
        let each = typical.unwrap_or_else(|| remaining.div_ceil(run.len() as u64));
        for (k, segment) in run.iter().enumerate() {
            let len = if k + 1 == run.len() {
                remaining
            } else {
                each.min(remaining)
            };
            gaps.push(Gap {
                segment_index: segment.segment_index,
                offset: cursor,
                len,
            });
            cursor += len;
            remaining -= len;
        }
    }

    let size = file_size.unwrap_or(cursor);
    out.set_len(size).await?;
    out.flush().await?;
    out.sync_all().await?;

    if gaps.is_empty() {
        let expected = file_size.unwrap_or_else(|| file.declared_size());
        if !contiguous || cursor != expected {
            return Err(mismatch(format!(
                "{}: reassembled {} bytes, expected {}",
                file.filename, cursor, expected
            )));
        }
    }
    Ok((size, gaps))
}

fn mismatch(message: String) -> crate::error::Error {
    JobError::IntegrityMismatch(message).into()
}

fn staging_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::nzb::{FileKind, Segment};
    use tempfile::TempDir;

    fn file(sizes: &[u64]) -> NzbFile {
        NzbFile {
            index: 0,
            subject: "\"movie.mkv\" yEnc".to_string(),
            poster: "poster".to_string(),
            date: 0,
            groups: vec!["alt.binaries.test".to_string()],
            filename: "movie.mkv".to_string(),
            kind: FileKind::Media,
            segments: sizes
                .iter()
                .enumerate()
                .map(|(i, &bytes)| Segment {
                    file_index: 0,
                    segment_index: i,
                    number: i as u32 + 1,
                    message_id: format!("{i}@test"),
                    bytes,
                })
                .collect(),
        }
    }

    /// Spool `chunks` as consecutive parts of one file
    async fn spool(dir: &Path, chunks: &[&[u8]]) -> Vec<Option<SpooledPart>> {
        let mut parts = Vec::new();
        let mut offset = 0;
        for (i, chunk) in chunks.iter().enumerate() {
            let path = dir.join(format!("seg-{i}"));
            tokio::fs::write(&path, chunk).await.unwrap();
            parts.push(Some(SpooledPart { path, offset }));
            offset += chunk.len() as u64;
        }
        parts
    }

    #[tokio::test]
    async fn joins_parts_in_authored_order() {
        let dir = TempDir::new().unwrap();
        let parts = spool(dir.path(), &[b"first-", b"second-", b"third"]).await;
        let dest = dir.path().join("out/movie.mkv");

        let assembled = Reassembler
            .assemble(&file(&[6, 7, 5]), &parts, None, &dest)
            .await
            .unwrap();

        assert!(assembled.is_complete());
        assert_eq!(assembled.size, 18);
        assert_eq!(
            tokio::fs::read(&dest).await.unwrap(),
            b"first-second-third"
        );
        assert!(!dest.with_file_name("movie.mkv.part").exists());
    }

    #[tokio::test]
    async fn size_mismatch_is_reported_and_nothing_is_left_behind() {
        let dir = TempDir::new().unwrap();
        let parts = spool(dir.path(), &[b"abc", b"de"]).await;
        let dest = dir.path().join("movie.mkv");

        let err = Reassembler
            .assemble(&file(&[3, 3]), &parts, None, &dest)
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Job(JobError::IntegrityMismatch(_))));
        assert!(!dest.exists());
        assert!(!dest.with_file_name("movie.mkv.part").exists());
    }

    #[tokio::test]
    async fn encoder_declared_size_takes_precedence() {
        let dir = TempDir::new().unwrap();
        let parts = spool(dir.path(), &[b"abc", b"de"]).await;
        let dest = dir.path().join("movie.mkv");

        // NZB sizes count encoded article bytes; the decoded file is 5 bytes
        let assembled = Reassembler
            .assemble(&file(&[40, 40]), &parts, Some(5), &dest)
            .await
            .unwrap();
        assert_eq!(assembled.size, 5);
    }

    #[tokio::test]
    async fn missing_segments_become_zero_filled_gaps() {
        let dir = TempDir::new().unwrap();
        let mut parts = spool(dir.path(), &[b"aaaa", b"bbbb", b"cccc"]).await;
        parts[1] = None;
        let dest = dir.path().join("movie.mkv");

        let assembled = Reassembler
            .assemble(&file(&[4, 4, 4]), &parts, None, &dest)
            .await
            .unwrap();

        assert_eq!(
            assembled.gaps,
            vec![Gap {
                segment_index: 1,
                offset: 4,
                len: 4
            }]
        );
        assert_eq!(
            tokio::fs::read(&dest).await.unwrap(),
            b"aaaa\0\0\0\0cccc"
        );
    }

    #[tokio::test]
    async fn gaps_follow_part_offsets_not_article_sizes() {
        let dir = TempDir::new().unwrap();
        let mut parts = spool(dir.path(), &[b"abc", b"def", b"gh"]).await;
        parts[1] = None;
        let dest = dir.path().join("movie.mkv");

        let assembled = Reassembler
            .assemble(&file(&[40, 40, 40]), &parts, Some(8), &dest)
            .await
            .unwrap();

        assert_eq!(assembled.size, 8);
        assert_eq!(
            assembled.gaps,
            vec![Gap {
                segment_index: 1,
                offset: 3,
                len: 3
            }]
        );
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"abc\0\0\0gh");
    }

    #[tokio::test]
    async fn trailing_missing_run_is_split_by_part_size() {
        let dir = TempDir::new().unwrap();
        let mut parts = spool(dir.path(), &[b"aaaa", b"bbbb", b"cccc", b"dd"]).await;
        parts[2] = None;
        parts[3] = None;
        let dest = dir.path().join("movie.mkv");

        let assembled = Reassembler
            .assemble(&file(&[50, 50, 50, 30]), &parts, Some(14), &dest)
            .await
            .unwrap();

        assert_eq!(assembled.size, 14);
        assert_eq!(
            assembled.gaps,
            vec![
                Gap {
                    segment_index: 2,
                    offset: 8,
                    len: 4
                },
                Gap {
                    segment_index: 3,
                    offset: 12,
                    len: 2
                },
            ]
        );
    }

    #[tokio::test]
    async fn part_beyond_file_end_is_an_integrity_error() {
        let dir = TempDir::new().unwrap();
        let mut parts = spool(dir.path(), &[b"abcd"]).await;
        if let Some(part) = parts[0].as_mut() {
            part.offset = 2;
        }
        let dest = dir.path().join("movie.mkv");

        let err = Reassembler
            .assemble(&file(&[4]), &parts, Some(4), &dest)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Job(JobError::IntegrityMismatch(_))));
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn slot_count_must_match_segments() {
        let dir = TempDir::new().unwrap();
        let parts = spool(dir.path(), &[b"a"]).await;
        let result = Reassembler
            .assemble(&file(&[1, 1]), &parts, None, &dir.path().join("x"))
            .await;
        assert!(result.is_err());
    }
}
