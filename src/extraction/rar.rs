use super::{extraction_failed, safe_relative};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

fn is_password_error(message: &str) -> bool {
    let lower = message.to_lowercase();
    lower.contains("password") || lower.contains("encrypted") || message.contains("ERAR_BAD_PASSWORD")
}

fn convert(e: unrar::error::UnrarError, archive: &Path) -> Error {
    let message = e.to_string();
    if is_password_error(&message) {
        Error::WrongPassword {
            archive: archive.to_path_buf(),
        }
    } else {
        extraction_failed(archive, message)
    }
}

/// Unpack a RAR set starting at its first volume
///
/// Later volumes are picked up from the same directory by unrar.
pub(super) fn try_extract(archive: &Path, password: &str, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;

    let opened = if password.is_empty() {
        unrar::Archive::new(archive)
    } else {
        unrar::Archive::with_password(archive, password.as_bytes())
    };
    let mut at_header = opened
        .open_for_processing()
        .map_err(|e| convert(e, archive))?;

    let mut extracted = Vec::new();
    loop {
        let at_file = match at_header.read_header() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(e) => return Err(convert(e, archive)),
        };

        let header = at_file.entry();
        let relative = safe_relative(Path::new(&header.filename));
        at_header = match relative {
            Some(relative) if !header.is_directory() => {
                let target = dest.join(relative);
                let next = at_file
                    .extract_to(&target)
                    .map_err(|e| convert(e, archive))?;
                extracted.push(target);
                next
            }
            _ => at_file.skip().map_err(|e| convert(e, archive))?,
        };
    }

    Ok(extracted)
}
