//! Pre-flight checks on input images and projected output size.

use std::path::Path;

use crate::error::OutpaintError;
use crate::params::{zoom_scale, ExpandPixels};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Lowercase extensions (without dot) accepted as input.
pub const SUPPORTED_INPUT_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "webp", "bmp", "tiff", "tif"];

/// Largest accepted input, 4096 x 4096.
pub const MAX_INPUT_PIXELS: u64 = 4096 * 4096;

/// Projected outputs above this are rejected before any backend call.
pub const HARD_OUTPUT_PIXEL_LIMIT: u64 = 100_000_000;

/// Projected outputs above this only produce a warning.
pub const SOFT_OUTPUT_PIXEL_LIMIT: u64 = 50_000_000;

// ---------------------------------------------------------------------------
// Input
// ---------------------------------------------------------------------------

pub fn is_supported_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| {
            let lower = e.to_ascii_lowercase();
            SUPPORTED_INPUT_EXTENSIONS.contains(&lower.as_str())
        })
        .unwrap_or(false)
}

/// Check the source exists, has a supported extension, decodes, and fits
/// within [`MAX_INPUT_PIXELS`]. Returns `(width, height)`.
pub fn validate_input_image(path: &Path) -> Result<(u32, u32), OutpaintError> {
    if !path.exists() {
        return Err(OutpaintError::Validation(format!(
            "File not found: {}",
            path.display()
        )));
    }
    if !is_supported_image(path) {
        let ext = path
            .extension()
            .map(|e| format!(".{}", e.to_string_lossy()))
            .unwrap_or_else(|| "(none)".to_string());
        return Err(OutpaintError::Validation(format!(
            "Unsupported format: {ext}"
        )));
    }

    let (width, height) = image::image_dimensions(path)
        .map_err(|e| OutpaintError::Validation(format!("Cannot read image: {e}")))?;

    if u64::from(width) * u64::from(height) > MAX_INPUT_PIXELS {
        return Err(OutpaintError::Validation(format!(
            "Image too large: {width}x{height} (max 4096x4096)"
        )));
    }
    Ok((width, height))
}

// ---------------------------------------------------------------------------
// Output size
// ---------------------------------------------------------------------------

/// Projected output dimensions after zoom-out and expansion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutputSize {
    pub width: u64,
    pub height: u64,
}

impl OutputSize {
    pub fn pixels(&self) -> u64 {
        self.width * self.height
    }

    fn megapixels(&self) -> f64 {
        self.pixels() as f64 / 1e6
    }
}

/// Accepted projection; `warning` is set above the soft limit.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSizeCheck {
    pub size: OutputSize,
    pub warning: Option<String>,
}

pub fn project_output_size(
    width: u32,
    height: u32,
    zoom_out_percentage: u32,
    expand: &ExpandPixels,
) -> OutputSize {
    let scale = zoom_scale(zoom_out_percentage);
    let scaled_w = (f64::from(width) * scale) as u64;
    let scaled_h = (f64::from(height) * scale) as u64;
    OutputSize {
        width: scaled_w + expand.horizontal(),
        height: scaled_h + expand.vertical(),
    }
}

/// Reject projections above [`HARD_OUTPUT_PIXEL_LIMIT`], warn above
/// [`SOFT_OUTPUT_PIXEL_LIMIT`].
pub fn check_output_size(
    width: u32,
    height: u32,
    zoom_out_percentage: u32,
    expand: &ExpandPixels,
) -> Result<OutputSizeCheck, OutpaintError> {
    let size = project_output_size(width, height, zoom_out_percentage, expand);
    let total = size.pixels();

    if total > HARD_OUTPUT_PIXEL_LIMIT {
        return Err(OutpaintError::Validation(format!(
            "Output {}x{} ({:.1}MP) exceeds 100MP limit",
            size.width,
            size.height,
            size.megapixels()
        )));
    }

    let warning = (total > SOFT_OUTPUT_PIXEL_LIMIT).then(|| {
        format!(
            "Large output: {}x{} ({:.1}MP) - may be slow",
            size.width,
            size.height,
            size.megapixels()
        )
    });
    Ok(OutputSizeCheck { size, warning })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn write_png(dir: &Path, name: &str, w: u32, h: u32) -> std::path::PathBuf {
        let path = dir.join(name);
        image::RgbImage::new(w, h).save(&path).unwrap();
        path
    }

    // -- input --

    #[test]
    fn extension_check_is_case_insensitive() {
        assert!(is_supported_image(Path::new("a/B.PNG")));
        assert!(is_supported_image(Path::new("c.tif")));
        assert!(!is_supported_image(Path::new("d.gif")));
        assert!(!is_supported_image(Path::new("noext")));
    }

    #[test]
    fn missing_file_rejected() {
        let err = validate_input_image(Path::new("/nope/missing.png")).unwrap_err();
        assert_matches!(err, OutpaintError::Validation(m) if m.starts_with("File not found"));
    }

    #[test]
    fn unsupported_extension_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("anim.gif");
        std::fs::write(&path, b"GIF89a").unwrap();
        let err = validate_input_image(&path).unwrap_err();
        assert_matches!(err, OutpaintError::Validation(m) if m == "Unsupported format: .gif");
    }

    #[test]
    fn corrupt_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.png");
        std::fs::write(&path, b"not an image").unwrap();
        assert_matches!(
            validate_input_image(&path),
            Err(OutpaintError::Validation(m)) if m.starts_with("Cannot read image")
        );
    }

    #[test]
    fn dimensions_returned() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "ok.png", 40, 20);
        assert_eq!(validate_input_image(&path).unwrap(), (40, 20));
    }

    #[test]
    fn oversized_input_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_png(dir.path(), "wide.png", 4097, 4096);
        assert_matches!(
            validate_input_image(&path),
            Err(OutpaintError::Validation(m)) if m.contains("too large")
        );
    }

    // -- output size --

    #[test]
    fn projection_applies_zoom_then_expansion() {
        let size = project_output_size(1000, 500, 50, &ExpandPixels::new(10, 10, 5, 5));
        assert_eq!(size, OutputSize { width: 2020, height: 1010 });
    }

    #[test]
    fn small_output_has_no_warning() {
        let check = check_output_size(1000, 500, 0, &ExpandPixels::new(300, 300, 150, 150)).unwrap();
        assert_eq!(check.size.pixels(), 1600 * 800);
        assert!(check.warning.is_none());
    }

    #[test]
    fn soft_limit_warns() {
        let check = check_output_size(4096, 4096, 30, &ExpandPixels::new(700, 700, 700, 700)).unwrap();
        assert_eq!(check.size, OutputSize { width: 7251, height: 7251 });
        assert!(check.warning.is_some());
    }

    #[test]
    fn hard_limit_rejects() {
        let result = check_output_size(4096, 4096, 60, &ExpandPixels::default());
        assert_matches!(result, Err(OutpaintError::Validation(m)) if m.contains("exceeds 100MP"));
    }
}
