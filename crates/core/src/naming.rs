//! Output naming and collision policy.
//!
//! Convention: `{stem}{suffix}[_{index}].{ext}` where the 1-based index is
//! present only when more than one image is requested.

use std::path::{Path, PathBuf};

use crate::error::CoreError;
use crate::types::OutputFormat;

/// Highest `_N` tried by [`next_available_path`].
pub const MAX_INCREMENT: u32 = 999;

/// Build the output filename for one generated image.
///
/// ```
/// use outpaint_core::naming::output_filename;
/// use outpaint_core::types::OutputFormat;
///
/// assert_eq!(output_filename("cat", "-expanded", None, OutputFormat::Png), "cat-expanded.png");
/// assert_eq!(output_filename("cat", "-x", Some(2), OutputFormat::Webp), "cat-x_2.webp");
/// ```
pub fn output_filename(stem: &str, suffix: &str, index: Option<u32>, format: OutputFormat) -> String {
    let mut name = String::with_capacity(stem.len() + suffix.len() + 8);
    name.push_str(stem);
    name.push_str(suffix);
    if let Some(idx) = index {
        name.push('_');
        name.push_str(&idx.to_string());
    }
    name.push('.');
    name.push_str(format.extension());
    name
}

/// Every target path a job would write, in output order.
pub fn expected_targets(
    dir: &Path,
    stem: &str,
    suffix: &str,
    num_images: u32,
    format: OutputFormat,
) -> Vec<PathBuf> {
    (1..=num_images)
        .map(|i| {
            let index = (num_images > 1).then_some(i);
            dir.join(output_filename(stem, suffix, index, format))
        })
        .collect()
}

/// First free `{stem}_N.{ext}` for N in `2..=999`, or `path` if it is free.
pub fn next_available_path(path: &Path) -> Result<PathBuf, CoreError> {
    if !path.exists() {
        return Ok(path.to_path_buf());
    }
    let parent = path.parent().unwrap_or_else(|| Path::new(""));
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = path
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy()))
        .unwrap_or_default();

    (2..=MAX_INCREMENT)
        .map(|n| parent.join(format!("{stem}_{n}{ext}")))
        .find(|candidate| !candidate.exists())
        .ok_or_else(|| {
            CoreError::Validation(format!(
                "No free filename for {} after {MAX_INCREMENT} attempts",
                path.display()
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_image_has_no_index() {
        let targets = expected_targets(Path::new("/out"), "beach", "-expanded", 1, OutputFormat::Jpeg);
        assert_eq!(targets, vec![PathBuf::from("/out/beach-expanded.jpeg")]);
    }

    #[test]
    fn multiple_images_are_indexed_from_one() {
        let targets = expected_targets(Path::new("/out"), "beach", "-x", 3, OutputFormat::Png);
        assert_eq!(
            targets,
            vec![
                PathBuf::from("/out/beach-x_1.png"),
                PathBuf::from("/out/beach-x_2.png"),
                PathBuf::from("/out/beach-x_3.png"),
            ]
        );
    }

    #[test]
    fn free_path_returned_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a-expanded.png");
        assert_eq!(next_available_path(&path).unwrap(), path);
    }

    #[test]
    fn increments_past_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a-expanded.png");
        std::fs::write(&path, b"1").unwrap();
        std::fs::write(dir.path().join("a-expanded_2.png"), b"2").unwrap();
        assert_eq!(
            next_available_path(&path).unwrap(),
            dir.path().join("a-expanded_3.png")
        );
    }
}
