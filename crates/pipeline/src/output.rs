//! Re-encoding backend payloads and placing them next to their targets.

use std::io::Write;
use std::path::{Path, PathBuf};

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::codecs::webp::WebPEncoder;
use image::{DynamicImage, ExtendedColorType};
use outpaint_core::config::{OutpaintConfig, ReprocessMode};
use outpaint_core::error::OutpaintError;
use outpaint_core::imaging::flatten_onto_white;
use outpaint_core::naming::next_available_path;
use outpaint_core::types::OutputFormat;

pub const JPEG_OUTPUT_QUALITY: u8 = 95;

/// What to do when a target path already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Replace the existing file.
    Overwrite,
    /// Write to the next free `{stem}_N.{ext}`.
    Increment,
    /// Leave the file alone and report it as this job's output.
    KeepExisting,
}

impl Placement {
    pub fn from_config(config: &OutpaintConfig) -> Self {
        match (config.allow_reprocess, config.reprocess_mode) {
            (false, _) => Self::KeepExisting,
            (true, ReprocessMode::Overwrite) => Self::Overwrite,
            (true, ReprocessMode::Increment) => Self::Increment,
        }
    }
}

/// Decode a backend payload and re-encode it in `format`.
///
/// JPEG output is flattened onto white since the format has no alpha.
pub fn encode_output(payload: &[u8], format: OutputFormat) -> Result<Vec<u8>, OutpaintError> {
    let img = image::load_from_memory(payload)
        .map_err(|e| OutpaintError::Output(format!("Cannot decode backend image: {e}")))?;

    let mut buf = Vec::new();
    let result = match format {
        OutputFormat::Png => img.write_with_encoder(PngEncoder::new(&mut buf)),
        OutputFormat::Jpeg => flatten_onto_white(&img)
            .write_with_encoder(JpegEncoder::new_with_quality(&mut buf, JPEG_OUTPUT_QUALITY)),
        OutputFormat::Webp => encode_webp(&img, &mut buf),
    };
    result.map_err(|e| OutpaintError::Output(format!("{} encode failed: {e}", format.extension())))?;
    Ok(buf)
}

fn encode_webp(img: &DynamicImage, buf: &mut Vec<u8>) -> image::ImageResult<()> {
    let encoder = WebPEncoder::new_lossless(buf);
    if img.color().has_alpha() {
        let rgba = img.to_rgba8();
        encoder.encode(rgba.as_raw(), rgba.width(), rgba.height(), ExtendedColorType::Rgba8)
    } else {
        let rgb = img.to_rgb8();
        encoder.encode(rgb.as_raw(), rgb.width(), rgb.height(), ExtendedColorType::Rgb8)
    }
}

/// Write `bytes` to a temp file in the destination directory, then rename
/// over `path`. Readers never observe a partial file.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), OutpaintError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let fail = |e: &dyn std::fmt::Display| {
        OutpaintError::Output(format!("Cannot write {}: {e}", path.display()))
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| fail(&e))?;
    tmp.write_all(bytes).map_err(|e| fail(&e))?;
    tmp.as_file().sync_all().map_err(|e| fail(&e))?;
    tmp.persist(path).map_err(|e| fail(&e.error))?;
    Ok(())
}

/// Place each payload at its target according to `placement`.
///
/// At most `targets.len()` files are produced. Every payload that needs
/// writing is encoded before the first write so a decode failure leaves
/// the directory untouched.
pub fn write_outputs(
    payloads: &[Vec<u8>],
    targets: &[PathBuf],
    format: OutputFormat,
    placement: Placement,
) -> Result<Vec<PathBuf>, OutpaintError> {
    enum Step {
        Keep(PathBuf),
        Write(PathBuf, Vec<u8>),
    }

    let mut steps = Vec::with_capacity(targets.len());
    for (payload, target) in payloads.iter().zip(targets) {
        if target.exists() && placement == Placement::KeepExisting {
            steps.push(Step::Keep(target.clone()));
            continue;
        }
        steps.push(Step::Write(target.clone(), encode_output(payload, format)?));
    }

    let mut written = Vec::with_capacity(steps.len());
    for step in steps {
        match step {
            Step::Keep(path) => written.push(path),
            Step::Write(target, bytes) => {
                let dest = match placement {
                    Placement::Increment => next_available_path(&target)?,
                    _ => target,
                };
                write_atomic(&dest, &bytes)?;
                written.push(dest);
            }
        }
    }

    if written.is_empty() {
        return Err(OutpaintError::Output("No outputs written".into()));
    }
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    fn png_payload(alpha: u8) -> Vec<u8> {
        let img = RgbaImage::from_pixel(4, 3, Rgba([200, 10, 10, alpha]));
        let mut buf = Vec::new();
        DynamicImage::ImageRgba8(img)
            .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .unwrap();
        buf
    }

    // -- encode_output --

    #[test]
    fn jpeg_output_is_flattened() {
        let out = encode_output(&png_payload(0), OutputFormat::Jpeg).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::Jpeg);
        let decoded = image::load_from_memory(&out).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (4, 3));
        let px = decoded.get_pixel(1, 1).0;
        assert!(px.iter().all(|c| *c > 240), "expected white, got {px:?}");
    }

    #[test]
    fn webp_output_decodes() {
        let out = encode_output(&png_payload(128), OutputFormat::Webp).unwrap();
        assert_eq!(image::guess_format(&out).unwrap(), ImageFormat::WebP);
        let decoded = image::load_from_memory(&out).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (4, 3));
    }

    #[test]
    fn garbage_payload_is_output_error() {
        let err = encode_output(b"not an image", OutputFormat::Png).unwrap_err();
        assert!(matches!(err, OutpaintError::Output(_)));
    }

    // -- placement --

    #[test]
    fn placement_follows_reprocess_settings() {
        let mut cfg = OutpaintConfig::default();
        cfg.allow_reprocess = false;
        assert_eq!(Placement::from_config(&cfg), Placement::KeepExisting);
        cfg.allow_reprocess = true;
        cfg.reprocess_mode = ReprocessMode::Overwrite;
        assert_eq!(Placement::from_config(&cfg), Placement::Overwrite);
        cfg.reprocess_mode = ReprocessMode::Increment;
        assert_eq!(Placement::from_config(&cfg), Placement::Increment);
    }

    // -- write_outputs --

    #[test]
    fn increment_never_touches_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cat-expanded.png");
        std::fs::write(&target, b"original").unwrap();

        let written = write_outputs(
            &[png_payload(255)],
            &[target.clone()],
            OutputFormat::Png,
            Placement::Increment,
        )
        .unwrap();

        assert_eq!(written, vec![dir.path().join("cat-expanded_2.png")]);
        assert_eq!(std::fs::read(&target).unwrap(), b"original");
    }

    #[test]
    fn keep_existing_reports_existing_path() {
        let dir = tempfile::tempdir().unwrap();
        let existing = dir.path().join("cat-expanded_1.png");
        let fresh = dir.path().join("cat-expanded_2.png");
        std::fs::write(&existing, b"original").unwrap();

        let written = write_outputs(
            &[png_payload(255), png_payload(255)],
            &[existing.clone(), fresh.clone()],
            OutputFormat::Png,
            Placement::KeepExisting,
        )
        .unwrap();

        assert_eq!(written, vec![existing.clone(), fresh.clone()]);
        assert_eq!(std::fs::read(&existing).unwrap(), b"original");
        assert!(image::open(&fresh).is_ok());
    }

    #[test]
    fn never_more_outputs_than_targets() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cat.png");
        let written = write_outputs(
            &[png_payload(255), png_payload(255), png_payload(255)],
            &[target.clone()],
            OutputFormat::Png,
            Placement::Overwrite,
        )
        .unwrap();
        assert_eq!(written, vec![target]);
    }

    #[test]
    fn overwrite_replaces_content() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("cat.jpeg");
        std::fs::write(&target, b"stale").unwrap();
        write_outputs(&[png_payload(255)], &[target.clone()], OutputFormat::Jpeg, Placement::Overwrite)
            .unwrap();
        assert_eq!(image::guess_format(&std::fs::read(&target).unwrap()).unwrap(), ImageFormat::Jpeg);
    }

    #[test]
    fn empty_payloads_fail() {
        let dir = tempfile::tempdir().unwrap();
        let err = write_outputs(&[], &[dir.path().join("a.png")], OutputFormat::Png, Placement::Overwrite)
            .unwrap_err();
        assert!(matches!(err, OutpaintError::Output(m) if m == "No outputs written"));
    }

    #[test]
    fn decode_failure_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let a = dir.path().join("a.png");
        let b = dir.path().join("b.png");
        let err = write_outputs(
            &[png_payload(255), b"junk".to_vec()],
            &[a.clone(), b],
            OutputFormat::Png,
            Placement::Overwrite,
        );
        assert!(err.is_err());
        assert!(!a.exists());
    }
}
