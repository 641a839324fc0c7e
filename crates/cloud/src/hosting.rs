//! Source image staging: shrink, flatten, JPEG-encode and upload to a
//! public image host so the queue service can fetch it by URL.

use std::path::Path;
use std::time::Duration;

use base64::Engine;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use outpaint_core::error::{OutpaintError, TransportKind};
use outpaint_core::imaging::flatten_onto_white;
use serde::Deserialize;

pub const FREEIMAGE_ENDPOINT: &str = "https://freeimage.host/api/1/upload";
pub const ENV_FREEIMAGE_KEY: &str = "FREEIMAGE_API_KEY";
/// Public guest key published by freeimage.host.
pub const DEFAULT_FREEIMAGE_KEY: &str = "6d207e02198a847aa98d0a2a901485a5";

/// Longest side sent to the host; larger images are shrunk to fit.
pub const MAX_UPLOAD_SIDE: u32 = 4096;
pub const UPLOAD_JPEG_QUALITY: u8 = 85;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// Preparation
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct PreparedUpload {
    pub jpeg: Vec<u8>,
    /// Original dimensions when the image had to be shrunk.
    pub resized_from: Option<(u32, u32)>,
}

/// Decode `path` and produce the JPEG that gets uploaded.
pub fn prepare_upload(path: &Path) -> Result<PreparedUpload, OutpaintError> {
    let img = image::open(path)
        .map_err(|e| OutpaintError::Validation(format!("Cannot read image: {e}")))?;

    let (width, height) = (img.width(), img.height());
    let (img, resized_from) = if width > MAX_UPLOAD_SIDE || height > MAX_UPLOAD_SIDE {
        (
            img.resize(MAX_UPLOAD_SIDE, MAX_UPLOAD_SIDE, FilterType::Lanczos3),
            Some((width, height)),
        )
    } else {
        (img, None)
    };

    let rgb = flatten_onto_white(&img);
    let mut jpeg = Vec::new();
    rgb.write_with_encoder(JpegEncoder::new_with_quality(&mut jpeg, UPLOAD_JPEG_QUALITY))
    .map_err(|e| OutpaintError::Output(format!("JPEG encode failed: {e}")))?;

    Ok(PreparedUpload { jpeg, resized_from })
}

// ---------------------------------------------------------------------------
// Host client
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Image host error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Image host upload failed: {0}")]
    Rejected(String),
}

impl From<HostError> for OutpaintError {
    fn from(err: HostError) -> Self {
        match &err {
            HostError::Request(e) => {
                let kind = if e.is_timeout() {
                    TransportKind::Timeout
                } else {
                    TransportKind::Other
                };
                OutpaintError::transport(kind, err.to_string())
            }
            _ => OutpaintError::Execution(err.to_string()),
        }
    }
}

#[derive(Debug, Deserialize)]
struct UploadResponse {
    status_code: Option<u16>,
    image: Option<UploadedImage>,
}

#[derive(Debug, Deserialize)]
struct UploadedImage {
    url: Option<String>,
}

#[derive(Clone)]
pub struct FreeImageHost {
    client: reqwest::Client,
    endpoint: String,
    key: String,
}

impl FreeImageHost {
    /// Public endpoint, key from `FREEIMAGE_API_KEY` or the guest key.
    pub fn from_env() -> Self {
        let key = std::env::var(ENV_FREEIMAGE_KEY)
            .ok()
            .filter(|k| !k.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_FREEIMAGE_KEY.to_string());
        Self::with_endpoint(reqwest::Client::new(), FREEIMAGE_ENDPOINT, &key)
    }

    pub fn with_endpoint(client: reqwest::Client, endpoint: &str, key: &str) -> Self {
        Self {
            client,
            endpoint: endpoint.to_string(),
            key: key.to_string(),
        }
    }

    /// Upload JPEG bytes and return the public URL.
    pub async fn upload(&self, jpeg: &[u8]) -> Result<String, HostError> {
        let source = base64::engine::general_purpose::STANDARD.encode(jpeg);
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[
                ("key", self.key.as_str()),
                ("action", "upload"),
                ("source", source.as_str()),
                ("format", "json"),
            ])
            .timeout(UPLOAD_TIMEOUT)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let body: UploadResponse = response.json().await?;
        match body {
            UploadResponse {
                status_code: Some(200),
                image: Some(UploadedImage { url: Some(url) }),
            } if !url.is_empty() => Ok(url),
            other => Err(HostError::Rejected(format!("{other:?}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Rgba, RgbaImage};

    #[test]
    fn transparent_png_becomes_jpeg() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("alpha.png");
        RgbaImage::from_pixel(8, 4, Rgba([0, 0, 0, 0])).save(&path).unwrap();

        let prepared = prepare_upload(&path).unwrap();
        assert!(prepared.resized_from.is_none());
        assert_eq!(&prepared.jpeg[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&prepared.jpeg).unwrap().to_rgb8();
        assert_eq!(decoded.dimensions(), (8, 4));
        assert!(decoded.get_pixel(0, 0).0.iter().all(|c| *c > 240));
    }

    #[test]
    fn oversized_image_is_shrunk_to_fit() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("wide.png");
        image::RgbImage::new(5000, 100).save(&path).unwrap();

        let prepared = prepare_upload(&path).unwrap();
        assert_eq!(prepared.resized_from, Some((5000, 100)));
        let decoded = image::load_from_memory(&prepared.jpeg).unwrap();
        assert_eq!(decoded.width(), 4096);
        assert!(decoded.height() <= 100);
    }

    #[test]
    fn unreadable_file_is_validation_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("junk.png");
        std::fs::write(&path, b"junk").unwrap();
        assert!(matches!(prepare_upload(&path), Err(OutpaintError::Validation(_))));
    }
}
