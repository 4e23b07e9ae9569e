//! Extraction stage
//!
//! Unpacks RAR, 7z and ZIP payloads with password attempts. Files that are not
//! archives pass through unchanged. Every archive is unpacked into a staging
//! directory outside the destination, and output is promoted only after all of
//! them succeeded, so a failure leaves the destination and the inputs as they
//! were.

mod passwords;
mod rar;
mod sevenz;
mod zip;

pub use passwords::PasswordList;

use crate::error::{Error, JobError, Result};
use crate::utils::unique_path;
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::LazyLock;
use tokio::task::spawn_blocking;

static RAR_PART: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.part0*(\d+)\.rar$").ok());
static CONTINUATION: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.(r\d{2,3}|\d{3})$").ok());
static SPLIT_7Z: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"(?i)\.7z\.0*(\d+)$").ok());
static SET_STEM: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"(?i)^(.+?)(\.part\d+\.rar|\.rar|\.r\d{2,3}|\.7z\.\d{3}|\.zip\.\d{3}|\.7z|\.zip|\.\d{3})$")
        .ok()
});

/// Archive formats the stage can unpack
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    /// RAR, including multi-volume sets
    Rar,
    /// 7-Zip
    SevenZip,
    /// ZIP
    Zip,
}

impl ArchiveFormat {
    fn try_extract(self, archive: &Path, password: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        match self {
            ArchiveFormat::Rar => rar::try_extract(archive, password, dest),
            ArchiveFormat::SevenZip => sevenz::try_extract(archive, password, dest),
            ArchiveFormat::Zip => zip::try_extract(archive, password, dest),
        }
    }
}

/// Format of the archive to open at `path`, if it is the entry point of one
///
/// Continuation volumes (`.r00`, `.part02.rar`, `.7z.002`, `.001`) return
/// `None`. The first volume of a split 7z set (`.7z.001`) is an entry point.
pub fn detect_format(path: &Path) -> Option<ArchiveFormat> {
    let name = path.file_name()?.to_str()?;
    if let Some(caps) = SPLIT_7Z.as_ref().and_then(|re| re.captures(name)) {
        let first = caps.get(1).is_some_and(|n| n.as_str() == "1");
        return first.then_some(ArchiveFormat::SevenZip);
    }
    let ext = path.extension()?.to_str()?.to_lowercase();
    match ext.as_str() {
        "rar" => {
            let first = match RAR_PART.as_ref().and_then(|re| re.captures(name)) {
                Some(caps) => caps.get(1).is_some_and(|n| n.as_str() == "1"),
                None => true,
            };
            first.then_some(ArchiveFormat::Rar)
        }
        "7z" => Some(ArchiveFormat::SevenZip),
        "zip" => Some(ArchiveFormat::Zip),
        _ => None,
    }
}

/// Whether `path` belongs to an archive set (entry point or continuation)
pub fn is_archive_volume(path: &Path) -> bool {
    if detect_format(path).is_some() {
        return true;
    }
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    name.to_lowercase().ends_with(".rar")
        || CONTINUATION
            .as_ref()
            .is_some_and(|re| re.is_match(name))
}

/// Name shared by every volume of an archive set, lowercased
fn set_stem(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_str()?;
    let caps = SET_STEM.as_ref()?.captures(name)?;
    Some(caps.get(1)?.as_str().to_lowercase())
}

/// Volumes of the split 7z set opened by `first`, in order
fn split_volumes(first: &Path, files: &[PathBuf]) -> Vec<PathBuf> {
    let stem = set_stem(first);
    let mut volumes: Vec<(u32, PathBuf)> = files
        .iter()
        .filter(|f| set_stem(f) == stem)
        .filter_map(|f| {
            let name = f.file_name()?.to_str()?;
            let caps = SPLIT_7Z.as_ref()?.captures(name)?;
            let number = caps.get(1)?.as_str().parse().ok()?;
            Some((number, f.clone()))
        })
        .collect();
    volumes.sort();
    volumes.into_iter().map(|(_, path)| path).collect()
}

/// Concatenate split volumes into one archive at `joined`
fn join_volumes(volumes: &[PathBuf], joined: &Path) -> Result<()> {
    if let Some(parent) = joined.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(joined)?;
    for volume in volumes {
        let mut input = std::fs::File::open(volume)?;
        std::io::copy(&mut input, &mut out)?;
    }
    out.sync_all()?;
    Ok(())
}

/// Unpacks payload files into a destination directory
#[derive(Debug, Default, Clone, Copy)]
pub struct ExtractionStage;

impl ExtractionStage {
    /// Unpack archives among `files` into `dest` and move the remaining files there
    ///
    /// Every archive is unpacked below `staging` first; nothing reaches `dest`
    /// until all of them succeeded. Volumes whose set has no entry point among
    /// `files` pass through like any other file. Returns the paths of every
    /// file now in `dest`. On failure `dest` is untouched, the inputs stay
    /// where they were and the error is an [`JobError::ExtractionFailure`].
    pub async fn extract(
        &self,
        files: &[PathBuf],
        staging: &Path,
        dest: &Path,
        passwords: &PasswordList,
    ) -> Result<Vec<PathBuf>> {
        let mut archives = Vec::new();
        let mut volumes = Vec::new();
        let mut pass_through = Vec::new();
        for file in files {
            match detect_format(file) {
                Some(format) => archives.push((file, format)),
                None if is_archive_volume(file) => volumes.push(file),
                None => pass_through.push(file),
            }
        }
        let claimed: Vec<Option<String>> =
            archives.iter().map(|(archive, _)| set_stem(archive)).collect();
        for volume in volumes {
            let stem = set_stem(volume);
            if stem.is_none() || !claimed.contains(&stem) {
                tracing::debug!(file = %volume.display(), "Volume without an entry point, keeping as is");
                pass_through.push(volume);
            }
        }

        let unpacked = self.unpack_all(&archives, files, staging, passwords).await;
        let unpacked = match unpacked {
            Ok(unpacked) => unpacked,
            Err(e) => {
                let _ = crate::utils::remove_dir_if_exists(staging).await;
                return Err(e);
            }
        };

        tokio::fs::create_dir_all(dest).await?;
        let mut outputs = Vec::new();
        for (archive, root, extracted) in unpacked {
            outputs.extend(
                promote(&root, dest, extracted)
                    .await
                    .map_err(|e| as_extraction_failure(e, archive))?,
            );
        }
        let _ = crate::utils::remove_dir_if_exists(staging).await;

        for file in pass_through {
            let Some(name) = file.file_name() else {
                continue;
            };
            let target = unique_path(&dest.join(name))?;
            crate::utils::move_into_place(file, &target).await?;
            outputs.push(target);
        }

        Ok(outputs)
    }

    /// Unpack each archive into its own directory below `staging`
    async fn unpack_all<'a>(
        &self,
        archives: &[(&'a PathBuf, ArchiveFormat)],
        files: &[PathBuf],
        staging: &Path,
        passwords: &PasswordList,
    ) -> Result<Vec<(&'a Path, PathBuf, Vec<PathBuf>)>> {
        let mut unpacked = Vec::with_capacity(archives.len());
        for (index, &(archive, format)) in archives.iter().enumerate() {
            let root = staging.join(format!("archive-{index}"));
            let source = self
                .prepare_source(archive, format, files, staging, index)
                .await
                .map_err(|e| as_extraction_failure(e, archive))?;
            let extracted = self
                .extract_one(&source, format, &root, passwords)
                .await
                .map_err(|e| as_extraction_failure(e, archive))?;
            unpacked.push((archive.as_path(), root, extracted));
        }
        Ok(unpacked)
    }

    /// The file to open for `archive`, joining split 7z volumes first
    async fn prepare_source(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        files: &[PathBuf],
        staging: &Path,
        index: usize,
    ) -> Result<PathBuf> {
        let is_split = archive
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|name| SPLIT_7Z.as_ref().is_some_and(|re| re.is_match(name)));
        if format != ArchiveFormat::SevenZip || !is_split {
            return Ok(archive.to_path_buf());
        }

        let volumes = split_volumes(archive, files);
        tracing::debug!(archive = %archive.display(), volumes = volumes.len(), "Joining split 7z volumes");
        let joined = staging.join(format!("joined-{index}.7z"));
        let target = joined.clone();
        spawn_blocking(move || join_volumes(&volumes, &target))
            .await
            .map_err(|e| extraction_failed(archive, format!("joining volumes panicked: {e}")))??;
        Ok(joined)
    }

    async fn extract_one(
        &self,
        archive: &Path,
        format: ArchiveFormat,
        staging: &Path,
        passwords: &PasswordList,
    ) -> Result<Vec<PathBuf>> {
        let candidates: Vec<String> = if passwords.is_empty() {
            vec![String::new()]
        } else {
            passwords.iter().map(str::to_string).collect()
        };

        tracing::info!(
            archive = %archive.display(),
            ?format,
            passwords = candidates.len(),
            "Extracting archive"
        );

        for (attempt, password) in candidates.iter().enumerate() {
            crate::utils::remove_dir_if_exists(staging).await?;

            let archive_owned = archive.to_path_buf();
            let staging_owned = staging.to_path_buf();
            let password_owned = password.clone();
            let result = spawn_blocking(move || {
                format.try_extract(&archive_owned, &password_owned, &staging_owned)
            })
            .await
            .map_err(|e| extraction_failed(archive, format!("extraction task panicked: {e}")))?;

            match result {
                Ok(files) => {
                    tracing::debug!(
                        archive = %archive.display(),
                        attempt = attempt + 1,
                        files = files.len(),
                        "Archive extracted"
                    );
                    return Ok(files);
                }
                Err(Error::WrongPassword { .. }) => {
                    tracing::debug!(archive = %archive.display(), attempt = attempt + 1, "Wrong password, trying next");
                }
                Err(e) => {
                    let _ = crate::utils::remove_dir_if_exists(staging).await;
                    return Err(e);
                }
            }
        }

        let _ = crate::utils::remove_dir_if_exists(staging).await;
        Err(extraction_failed(
            archive,
            format!("none of {} password(s) opened the archive", candidates.len()),
        ))
    }
}

/// Move extracted files from `staging` into `dest`, keeping their relative layout
async fn promote(staging: &Path, dest: &Path, files: Vec<PathBuf>) -> Result<Vec<PathBuf>> {
    let mut moved = Vec::with_capacity(files.len());
    for file in files {
        let relative = file.strip_prefix(staging).unwrap_or(&file).to_path_buf();
        let Some(relative) = safe_relative(&relative) else {
            continue;
        };
        let target = unique_path(&dest.join(relative))?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(&file, &target).await?;
        moved.push(target);
    }
    Ok(moved)
}

/// Only the normal components of an archive entry path
pub(crate) fn safe_relative(path: &Path) -> Option<PathBuf> {
    let cleaned: PathBuf = path
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    (!cleaned.as_os_str().is_empty()).then_some(cleaned)
}

/// Every regular file below `dir`
pub(crate) fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let path = entry?.path();
            if path.is_dir() {
                pending.push(path);
            } else {
                files.push(path);
            }
        }
    }
    files.sort();
    Ok(files)
}

pub(crate) fn extraction_failed(archive: &Path, reason: impl Into<String>) -> Error {
    JobError::ExtractionFailure {
        archive: archive.to_path_buf(),
        reason: reason.into(),
    }
    .into()
}

fn as_extraction_failure(e: Error, archive: &Path) -> Error {
    match e {
        Error::Job(JobError::ExtractionFailure { reason, .. }) => extraction_failed(archive, reason),
        other => extraction_failed(archive, other.to_string()),
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
