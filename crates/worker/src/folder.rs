//! Recursive discovery of supported source images.

use std::path::{Path, PathBuf};

use outpaint_core::error::CoreError;
use outpaint_core::validation::is_supported_image;

/// Every supported image under `root`, sorted by path.
///
/// Unreadable subdirectories are logged and skipped; an unreadable root
/// is an error.
pub fn scan_images(root: &Path) -> Result<Vec<PathBuf>, CoreError> {
    let mut found = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    let mut first = true;

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) if first => return Err(CoreError::Io(e)),
            Err(e) => {
                tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable directory");
                continue;
            }
        };
        first = false;

        for entry in entries.flatten() {
            let path = entry.path();
            match entry.file_type() {
                Ok(ft) if ft.is_dir() => stack.push(path),
                Ok(ft) if ft.is_file() && is_supported_image(&path) => found.push(path),
                _ => {}
            }
        }
    }

    found.sort();
    Ok(found)
}

/// A single file, or the images of a folder.
pub fn resolve_inputs(path: &Path) -> Result<Vec<PathBuf>, CoreError> {
    if path.is_file() {
        Ok(vec![path.to_path_buf()])
    } else {
        scan_images(path)
    }
}
