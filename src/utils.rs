//! Utility functions for file operations and path manipulation

use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Maximum number of rename attempts when resolving file collisions
const MAX_RENAME_ATTEMPTS: u32 = 9999;

/// Suffix of files being copied into place across filesystems
const PARTIAL_SUFFIX: &str = ".partial";

/// Get a path that does not exist yet, adding ` (n)` before the extension on collision
///
/// ```
/// use media_acquire::utils::unique_path;
/// use std::path::Path;
///
/// let path = Path::new("/tmp/definitely-not-here/movie.mkv");
/// assert_eq!(unique_path(path).unwrap(), path);
/// ```
pub fn unique_path(path: &Path) -> Result<PathBuf> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }

    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(|| Error::Other(format!("cannot extract file stem of {}", path.display())))?;
    let extension = path.extension().and_then(|e| e.to_str());
    let parent = path.parent().ok_or_else(|| {
        Error::Other(format!("cannot extract parent of {}", path.display()))
    })?;

    for i in 1..=MAX_RENAME_ATTEMPTS {
        let new_name = match extension {
            Some(ext) => format!("{} ({}).{}", stem, i, ext),
            None => format!("{} ({})", stem, i),
        };
        let candidate = parent.join(new_name);
        if !candidate.exists() {
            return Ok(candidate);
        }
    }

    Err(Error::Other(format!(
        "could not find unique filename for {} after {} attempts",
        path.display(),
        MAX_RENAME_ATTEMPTS
    )))
}

/// Make a posted or served filename safe to use as a single path component
pub fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    cleaned.trim().trim_start_matches('.').trim().to_string()
}

/// Extract a filename from an HTTP response, falling back to the URL path
///
/// Honours `Content-Disposition` (`filename=` and RFC 5987 `filename*=`).
/// The extension is kept.
pub fn filename_from_response(headers: &reqwest::header::HeaderMap, url: &str) -> String {
    if let Some(value) = headers
        .get(reqwest::header::CONTENT_DISPOSITION)
        .and_then(|v| v.to_str().ok())
    {
        for part in value.split(';').map(str::trim) {
            if let Some(encoded) = part.strip_prefix("filename*=") {
                let encoded = encoded.rsplit('\'').next().unwrap_or(encoded);
                let name = sanitize_filename(&percent_decode(encoded));
                if !name.is_empty() {
                    return name;
                }
            } else if let Some(plain) = part.strip_prefix("filename=") {
                let name = sanitize_filename(plain.trim_matches('"'));
                if !name.is_empty() {
                    return name;
                }
            }
        }
    }
    filename_from_url(url)
}

/// Last path segment of a URL, or "download"
pub fn filename_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|parsed| {
            parsed
                .path_segments()
                .and_then(|mut segments| segments.next_back().map(str::to_string))
        })
        .map(|segment| sanitize_filename(&percent_decode(&segment)))
        .filter(|name| !name.is_empty())
        .unwrap_or_else(|| "download".to_string())
}

fn percent_decode(value: &str) -> String {
    url::form_urlencoded::parse(format!("v={}", value.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| value.to_string())
}

/// Move `source` to `dest` so that `dest` only ever appears complete
///
/// A plain rename is atomic on the same filesystem. Across filesystems the data is
/// copied to a hidden `.partial` sibling of `dest` and renamed into place, then the
/// source is removed.
pub async fn move_into_place(source: &Path, dest: &Path) -> Result<()> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    match tokio::fs::rename(source, dest).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::CrossesDevices => {
            let file_name = dest
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| Error::Other(format!("invalid destination {}", dest.display())))?;
            let staging = dest.with_file_name(format!(".{file_name}{PARTIAL_SUFFIX}"));

            if let Err(e) = tokio::fs::copy(source, &staging).await {
                let _ = tokio::fs::remove_file(&staging).await;
                return Err(e.into());
            }
            tokio::fs::rename(&staging, dest).await?;
            tokio::fs::remove_file(source).await?;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Remove a directory tree, ignoring a missing directory
pub async fn remove_dir_if_exists(path: &Path) -> std::io::Result<()> {
    match tokio::fs::remove_dir_all(path).await {
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{CONTENT_DISPOSITION, HeaderMap, HeaderValue};
    use tempfile::TempDir;

    #[test]
    fn unique_path_adds_counter_on_collision() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("movie.mkv");
        std::fs::write(&path, b"x").unwrap();
        assert_eq!(unique_path(&path).unwrap(), dir.path().join("movie (1).mkv"));

        std::fs::write(dir.path().join("movie (1).mkv"), b"x").unwrap();
        assert_eq!(unique_path(&path).unwrap(), dir.path().join("movie (2).mkv"));
    }

    #[test]
    fn sanitize_strips_separators_and_leading_dots() {
        assert_eq!(sanitize_filename("../etc/passwd"), "_etc_passwd");
        assert_eq!(sanitize_filename("  .hidden.mkv "), "hidden.mkv");
        assert_eq!(sanitize_filename("a:b?.mkv"), "a_b_.mkv");
    }

    #[test]
    fn filename_prefers_content_disposition() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename=\"Channel 5.ts\""),
        );
        assert_eq!(
            filename_from_response(&headers, "http://example.com/stream?id=1"),
            "Channel 5.ts"
        );
    }

    #[test]
    fn filename_decodes_rfc5987() {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_DISPOSITION,
            HeaderValue::from_static("attachment; filename*=UTF-8''caf%C3%A9%2Bmore.mp4"),
        );
        assert_eq!(
            filename_from_response(&headers, "http://example.com/x"),
            "café+more.mp4"
        );
    }

    #[test]
    fn filename_falls_back_to_url() {
        assert_eq!(
            filename_from_url("http://example.com/vod/My%20Movie.mkv?token=abc"),
            "My Movie.mkv"
        );
        assert_eq!(filename_from_url("http://example.com/"), "download");
        assert_eq!(filename_from_url("not a url"), "download");
    }

    #[tokio::test]
    async fn move_into_place_renames_within_filesystem() {
        let dir = TempDir::new().unwrap();
        let source = dir.path().join("temp/file.bin");
        tokio::fs::create_dir_all(source.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&source, b"payload").await.unwrap();

        let dest = dir.path().join("final/file.bin");
        move_into_place(&source, &dest).await.unwrap();

        assert!(!source.exists());
        assert_eq!(tokio::fs::read(&dest).await.unwrap(), b"payload");
    }

    #[tokio::test]
    async fn remove_missing_dir_is_ok() {
        let dir = TempDir::new().unwrap();
        remove_dir_if_exists(&dir.path().join("nope")).await.unwrap();
    }
}
