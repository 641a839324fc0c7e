//! Generation parameters and expansion arithmetic.
//!
//! A [`GenerationParameters`] value is built once per request and is
//! read-only afterwards. Percentage expansion is resolved to pixels from
//! the *source* image dimensions via [`Expansion::resolve`].

use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::types::OutputFormat;

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

pub const MAX_ZOOM_OUT_PCT: u32 = 90;
pub const MAX_EXPAND_PX: u32 = 700;
pub const MAX_EXPAND_PCT: u32 = 200;
pub const MIN_NUM_IMAGES: u32 = 1;
pub const MAX_NUM_IMAGES: u32 = 4;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Directional expansion amounts in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ExpandPixels {
    pub left: u32,
    pub right: u32,
    pub top: u32,
    pub bottom: u32,
}

impl ExpandPixels {
    pub fn new(left: u32, right: u32, top: u32, bottom: u32) -> Self {
        Self {
            left,
            right,
            top,
            bottom,
        }
    }

    pub fn horizontal(&self) -> u64 {
        u64::from(self.left) + u64::from(self.right)
    }

    pub fn vertical(&self) -> u64 {
        u64::from(self.top) + u64::from(self.bottom)
    }

    pub fn is_zero(&self) -> bool {
        self.horizontal() == 0 && self.vertical() == 0
    }
}

/// How the canvas grows around the source image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expansion {
    Pixels(ExpandPixels),
    /// One percentage applied to width (left/right) and height (top/bottom).
    Percentage(u32),
}

impl Expansion {
    /// Convert to pixel amounts for a source of `width` x `height`.
    ///
    /// Percentages truncate toward zero, so 30% of 333 px is 99 px.
    pub fn resolve(&self, width: u32, height: u32) -> ExpandPixels {
        match *self {
            Self::Pixels(px) => px,
            Self::Percentage(pct) => {
                let horizontal = percent_of(width, pct);
                let vertical = percent_of(height, pct);
                ExpandPixels::new(horizontal, horizontal, vertical, vertical)
            }
        }
    }
}

fn percent_of(value: u32, pct: u32) -> u32 {
    let scaled = u64::from(value) * u64::from(pct) / 100;
    u32::try_from(scaled).unwrap_or(u32::MAX)
}

/// Immutable per-job generation settings.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParameters {
    pub zoom_out_percentage: u32,
    pub expansion: Expansion,
    pub num_images: u32,
    pub prompt: String,
    pub output_format: OutputFormat,
    /// Only honoured by the remote backend.
    pub enable_safety_checker: bool,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            zoom_out_percentage: 0,
            expansion: Expansion::Percentage(30),
            num_images: 1,
            prompt: String::new(),
            output_format: OutputFormat::Png,
            enable_safety_checker: true,
        }
    }
}

impl GenerationParameters {
    /// Check every field against its allowed range.
    pub fn validate(&self) -> Result<(), CoreError> {
        validate_zoom_out(self.zoom_out_percentage)?;
        validate_num_images(self.num_images)?;
        match self.expansion {
            Expansion::Pixels(px) => validate_expand_pixels(&px),
            Expansion::Percentage(pct) => validate_expand_percentage(pct),
        }
    }

    /// Rescale factor applied when zooming out: `1 / (1 - zoom/100)`.
    pub fn zoom_scale(&self) -> f64 {
        zoom_scale(self.zoom_out_percentage)
    }
}

/// `1 / (1 - pct/100)`; `1.0` when `pct` is zero.
pub fn zoom_scale(zoom_out_percentage: u32) -> f64 {
    let pct = f64::from(zoom_out_percentage.min(MAX_ZOOM_OUT_PCT));
    1.0 / (1.0 - pct / 100.0)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

pub fn validate_zoom_out(pct: u32) -> Result<(), CoreError> {
    if pct > MAX_ZOOM_OUT_PCT {
        return Err(CoreError::Validation(format!(
            "zoom_out_percentage must be between 0 and {MAX_ZOOM_OUT_PCT}, got {pct}"
        )));
    }
    Ok(())
}

pub fn validate_num_images(n: u32) -> Result<(), CoreError> {
    if !(MIN_NUM_IMAGES..=MAX_NUM_IMAGES).contains(&n) {
        return Err(CoreError::Validation(format!(
            "num_images must be between {MIN_NUM_IMAGES} and {MAX_NUM_IMAGES}, got {n}"
        )));
    }
    Ok(())
}

pub fn validate_expand_percentage(pct: u32) -> Result<(), CoreError> {
    if pct > MAX_EXPAND_PCT {
        return Err(CoreError::Validation(format!(
            "expand_percentage must be between 0 and {MAX_EXPAND_PCT}, got {pct}"
        )));
    }
    Ok(())
}

pub fn validate_expand_pixels(px: &ExpandPixels) -> Result<(), CoreError> {
    for (name, value) in [
        ("expand_left", px.left),
        ("expand_right", px.right),
        ("expand_top", px.top),
        ("expand_bottom", px.bottom),
    ] {
        if value > MAX_EXPAND_PX {
            return Err(CoreError::Validation(format!(
                "{name} must be between 0 and {MAX_EXPAND_PX}, got {value}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    // -- resolve --

    #[test]
    fn percentage_resolves_from_source_dimensions() {
        let px = Expansion::Percentage(30).resolve(1000, 500);
        assert_eq!(px, ExpandPixels::new(300, 300, 150, 150));
    }

    #[test]
    fn percentage_truncates() {
        let px = Expansion::Percentage(30).resolve(333, 101);
        assert_eq!(px, ExpandPixels::new(99, 99, 30, 30));
    }

    #[test]
    fn pixels_pass_through() {
        let raw = ExpandPixels::new(10, 20, 30, 40);
        assert_eq!(Expansion::Pixels(raw).resolve(4000, 4000), raw);
    }

    // -- validation --

    #[test]
    fn defaults_are_valid() {
        assert!(GenerationParameters::default().validate().is_ok());
    }

    #[test]
    fn zoom_above_limit_rejected() {
        let params = GenerationParameters {
            zoom_out_percentage: 91,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn num_images_bounds() {
        assert!(validate_num_images(0).is_err());
        assert!(validate_num_images(1).is_ok());
        assert!(validate_num_images(4).is_ok());
        assert!(validate_num_images(5).is_err());
    }

    #[test]
    fn expand_pixel_limit_names_field() {
        let err = validate_expand_pixels(&ExpandPixels::new(0, 0, 701, 0)).unwrap_err();
        assert!(err.to_string().contains("expand_top"));
    }

    #[test]
    fn expand_percentage_limit() {
        assert!(validate_expand_percentage(200).is_ok());
        assert!(validate_expand_percentage(201).is_err());
    }

    // -- zoom scale --

    #[test]
    fn zoom_scale_values() {
        assert_eq!(zoom_scale(0), 1.0);
        assert!((zoom_scale(50) - 2.0).abs() < 1e-9);
        assert!((zoom_scale(30) - 1.0 / 0.7).abs() < 1e-9);
    }
}
