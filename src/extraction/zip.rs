use super::extraction_failed;
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

fn wrong_password(archive: &Path) -> Error {
    Error::WrongPassword {
        archive: archive.to_path_buf(),
    }
}

fn classify(e: zip::result::ZipError, archive: &Path) -> Error {
    let message = e.to_string();
    if message.contains("password") || message.contains("encrypted") {
        wrong_password(archive)
    } else {
        extraction_failed(archive, message)
    }
}

/// Unpack a ZIP archive
pub(super) fn try_extract(archive: &Path, password: &str, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;

    let file = std::fs::File::open(archive)?;
    let mut zip = zip::ZipArchive::new(file).map_err(|e| classify(e, archive))?;

    let mut extracted = Vec::new();
    for i in 0..zip.len() {
        let mut entry = if password.is_empty() {
            zip.by_index(i).map_err(|e| classify(e, archive))?
        } else {
            zip.by_index_decrypt(i, password.as_bytes())
                .map_err(|e| classify(e, archive))?
                .map_err(|_| wrong_password(archive))?
        };

        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            tracing::warn!(archive = %archive.display(), entry = entry.name(), "Skipping entry with unsafe path");
            continue;
        };
        let target = dest.join(relative);

        if entry.is_dir() {
            std::fs::create_dir_all(&target)?;
            continue;
        }
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out = std::fs::File::create(&target)?;
        std::io::copy(&mut entry, &mut out).map_err(|e| {
            let message = e.to_string();
            // A checksum failure on a decrypted entry means the key was wrong
            if message.contains("password") || (!password.is_empty() && message.contains("checksum")) {
                wrong_password(archive)
            } else {
                Error::Io(e)
            }
        })?;
        extracted.push(target);
    }

    Ok(extracted)
}
