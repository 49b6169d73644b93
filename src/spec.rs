//! Request-side description of the edits to apply to one image.

use serde::{Deserialize, Serialize};

use crate::error::{ImageVaultError, Result};
use crate::image_handler::OutputFormat;
use crate::operators::{self, FilterKind, FlipAxis, WatermarkStyle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResizeSpec {
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CropSpec {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

/// Every field is optional and an absent field skips its stage. Stages always
/// run in the order resize, crop, rotate, watermark, flip, filter, so crop
/// coordinates refer to the resized image.
///
/// ```json
/// {"resize": {"width": 100}, "rotate": 90, "filter": "sepia", "format": "jpg"}
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TransformationSpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resize: Option<ResizeSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crop: Option<CropSpec>,
    /// Counter-clockwise degrees in `[0, 360]`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotate: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub watermark_style: Option<WatermarkStyle>,
    /// `"horizontal"` (mirror), `"vertical"` or `"both"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flip: Option<FlipAxis>,
    /// `"grayscale"` or `"sepia"`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
    /// `jpg`, `jpeg` or `png`. Absent keeps the original format.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// JPEG quality, 1 to 100.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<u8>,
}

impl TransformationSpec {
    /// Parse a JSON request body. Malformed JSON, unknown fields and negative
    /// geometry are validation errors.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| ImageVaultError::Validation(format!("invalid transformation: {}", e)))
    }

    /// Checks everything that can be checked without pixels: positive sizes,
    /// rotate range, filter and format names, watermark style, quality.
    pub fn validate(&self) -> Result<()> {
        if let Some(resize) = &self.resize {
            if resize.width == Some(0) || resize.height == Some(0) {
                return Err(ImageVaultError::InvalidParameter(
                    "resize dimensions must be greater than 0".into(),
                ));
            }
            operators::check_output_size(resize.width.unwrap_or(1), resize.height.unwrap_or(1))?;
        }
        if let Some(crop) = &self.crop {
            if crop.width == 0 || crop.height == 0 {
                return Err(ImageVaultError::InvalidParameter(
                    "crop dimensions must be greater than 0".into(),
                ));
            }
        }
        if let Some(degrees) = self.rotate {
            if !(0..=360).contains(&degrees) {
                return Err(ImageVaultError::InvalidParameter(format!(
                    "rotate angle {} is outside [0, 360]",
                    degrees
                )));
            }
        }
        if let Some(style) = &self.watermark_style {
            style.validate()?;
        }
        if let Some(quality) = self.quality {
            if !(1..=100).contains(&quality) {
                return Err(ImageVaultError::InvalidParameter(format!(
                    "quality {} is outside [1, 100]",
                    quality
                )));
            }
        }
        self.filter_kind()?;
        if let Some(format) = &self.format {
            format.parse::<OutputFormat>()?;
        }
        Ok(())
    }

    pub fn filter_kind(&self) -> Result<Option<FilterKind>> {
        self.filter.as_deref().map(str::parse).transpose()
    }

    /// The requested format if there is one, otherwise `original_format`.
    /// Either way the result must be in the supported set.
    pub fn resolve_format(&self, original_format: &str) -> Result<OutputFormat> {
        match &self.format {
            Some(requested) => requested.to_lowercase().parse(),
            None => original_format.parse(),
        }
    }
}
