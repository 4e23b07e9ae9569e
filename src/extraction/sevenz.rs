use super::{collect_files, extraction_failed};
use crate::error::{Error, Result};
use std::path::{Path, PathBuf};

/// Unpack a 7z archive
pub(super) fn try_extract(archive: &Path, password: &str, dest: &Path) -> Result<Vec<PathBuf>> {
    std::fs::create_dir_all(dest)?;

    let result = if password.is_empty() {
        sevenz_rust::decompress_file(archive, dest)
    } else {
        sevenz_rust::decompress_file_with_password(
            archive,
            dest,
            sevenz_rust::Password::from(password),
        )
    };

    match result {
        Ok(()) => {
            let files = collect_files(dest)?;
            ensure_contained(dest, &files, archive)?;
            Ok(files)
        }
        Err(e) => {
            let message = e.to_string();
            let lower = message.to_lowercase();
            if lower.contains("password") || lower.contains("encrypted") {
                Err(Error::WrongPassword {
                    archive: archive.to_path_buf(),
                })
            } else {
                Err(extraction_failed(archive, message))
            }
        }
    }
}

/// Reject archives whose entries escaped the destination
fn ensure_contained(dest: &Path, files: &[PathBuf], archive: &Path) -> Result<()> {
    let root = dest.canonicalize()?;
    for file in files {
        if !file.canonicalize()?.starts_with(&root) {
            return Err(extraction_failed(
                archive,
                format!("entry {} escapes the destination", file.display()),
            ));
        }
    }
    Ok(())
}
