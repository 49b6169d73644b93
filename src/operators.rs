//! Pure image operators. Each one consumes a `DynamicImage` and returns the
//! transformed image; invalid geometry is rejected, never clamped.

use image::imageops::FilterType;
use image::{DynamicImage, ImageBuffer, Luma, Pixel, Rgb, Rgba, RgbaImage};
use imageproc::geometric_transformations::{self, Interpolation, Projection};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tracing::debug;

use crate::error::{ImageVaultError, Result};
use crate::utils::convert::{SEPIA_MATRIX, apply_color_matrix, rgb_to_luma};
use crate::utils::glyphs;

/// Pixel height of one font cell at `font_scale == 1.0`.
const CELL_PX_AT_UNIT_SCALE: f32 = 3.0;

/// Resize filter for every resize stage.
const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// Largest image an operator may produce: 512 MiB of RGBA8, the same budget
/// `image::Limits` applies when decoding.
pub const MAX_OUTPUT_PIXELS: u64 = 512 * 1024 * 1024 / 4;

/// Reject output dimensions above [`MAX_OUTPUT_PIXELS`].
pub fn check_output_size(width: u32, height: u32) -> Result<()> {
    let pixels = width as u64 * height as u64;
    if pixels > MAX_OUTPUT_PIXELS {
        return Err(ImageVaultError::InvalidParameter(format!(
            "output of {}x{} exceeds the limit of {} pixels",
            width, height, MAX_OUTPUT_PIXELS
        )));
    }
    Ok(())
}

/// Resize to exact dimensions, or derive the missing side from the aspect ratio.
/// With neither side given the image is returned unchanged.
pub fn resize(image: DynamicImage, width: Option<u32>, height: Option<u32>) -> Result<DynamicImage> {
    let (src_w, src_h) = (image.width(), image.height());
    let (target_w, target_h) = match (width, height) {
        (None, None) => return Ok(image),
        (Some(w), Some(h)) => (positive("resize width", w)?, positive("resize height", h)?),
        (Some(w), None) => {
            let w = positive("resize width", w)?;
            (w, scale_side(w, src_h, src_w)?)
        }
        (None, Some(h)) => {
            let h = positive("resize height", h)?;
            (scale_side(h, src_w, src_h)?, h)
        }
    };

    check_output_size(target_w, target_h)?;

    debug!(src_w, src_h, target_w, target_h, "resize");
    Ok(image.resize_exact(target_w, target_h, RESIZE_FILTER))
}

// `given * other / base`, rounded, never below one pixel.
fn scale_side(given: u32, other: u32, base: u32) -> Result<u32> {
    if base == 0 || other == 0 {
        return Err(ImageVaultError::InvalidParameter(
            "cannot preserve aspect ratio of an empty image".into(),
        ));
    }
    let scaled = (given as f64 * other as f64 / base as f64).round();
    Ok(scaled.clamp(1.0, u32::MAX as f64) as u32)
}

/// Extract the `width` x `height` rectangle whose top-left corner is `(x, y)`.
pub fn crop(image: DynamicImage, x: u32, y: u32, width: u32, height: u32) -> Result<DynamicImage> {
    let width = positive("crop width", width)?;
    let height = positive("crop height", height)?;

    let fits_x = x.checked_add(width).is_some_and(|right| right <= image.width());
    let fits_y = y.checked_add(height).is_some_and(|bottom| bottom <= image.height());
    if !fits_x || !fits_y {
        return Err(ImageVaultError::InvalidParameter(format!(
            "crop rectangle ({}, {}, {}x{}) exceeds image bounds {}x{}",
            x,
            y,
            width,
            height,
            image.width(),
            image.height()
        )));
    }

    Ok(image.crop_imm(x, y, width, height))
}

/// Rotate counter-clockwise about the image center by `degrees` in `[0, 360]`.
///
/// The canvas expands to fit the rotated image. Right angles are lossless;
/// other angles are sampled bilinearly onto an RGBA canvas whose uncovered
/// corners are fully transparent.
pub fn rotate(image: DynamicImage, degrees: i32) -> Result<DynamicImage> {
    match degrees {
        0 | 360 => Ok(image),
        // `image` rotates clockwise.
        90 => Ok(image.rotate270()),
        180 => Ok(image.rotate180()),
        270 => Ok(image.rotate90()),
        1..=359 => {
            let rotated = rotate_expanded(&image.to_rgba8(), degrees as f32)?;
            debug!(
                degrees,
                width = rotated.width(),
                height = rotated.height(),
                "rotate onto expanded canvas"
            );
            Ok(DynamicImage::ImageRgba8(rotated))
        }
        _ => Err(ImageVaultError::InvalidParameter(format!(
            "rotate angle {} is outside [0, 360]",
            degrees
        ))),
    }
}

fn rotate_expanded(src: &RgbaImage, degrees: f32) -> Result<RgbaImage> {
    let theta = degrees.to_radians();
    let (sin, cos) = theta.sin_cos();
    let (w, h) = (src.width() as f32, src.height() as f32);

    // Bounding box of the rotated rectangle; the epsilon absorbs float noise.
    let out_w = ((w * cos.abs() + h * sin.abs()) - 1e-3).ceil().max(1.0) as u32;
    let out_h = ((w * sin.abs() + h * cos.abs()) - 1e-3).ceil().max(1.0) as u32;
    check_output_size(out_w, out_h)?;

    // `Projection::rotate` turns clockwise in image coordinates.
    let projection = Projection::translate(out_w as f32 / 2.0, out_h as f32 / 2.0)
        * Projection::rotate(-theta)
        * Projection::translate(-w / 2.0, -h / 2.0);

    let mut out = RgbaImage::new(out_w, out_h);
    geometric_transformations::warp_into(
        src,
        &projection,
        Interpolation::Bilinear,
        Rgba([0, 0, 0, 0]),
        &mut out,
    );
    Ok(out)
}

/// Axis to mirror across in [`flip`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipAxis {
    /// Left and right swap.
    Horizontal,
    /// Top and bottom swap.
    Vertical,
    Both,
}

/// Mirror the image. Dimensions are unchanged.
pub fn flip(image: DynamicImage, axis: FlipAxis) -> DynamicImage {
    match axis {
        FlipAxis::Horizontal => image.fliph(),
        FlipAxis::Vertical => image.flipv(),
        FlipAxis::Both => image.rotate180(),
    }
}

/// Appearance of a text watermark. Every field has a default, so a request
/// may name only the ones it wants to change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WatermarkStyle {
    /// Top-left corner of the text box, in pixels. Default `(10, 10)`.
    pub position: (u32, u32),
    /// Glyph scale; `1.0` renders 21 px tall text. Default `1.0`.
    pub font_scale: f32,
    /// RGB ink color. Default white.
    pub color: [u8; 3],
    /// Stroke width in pixels, at least 1. Default `2`.
    pub thickness: u32,
}

impl Default for WatermarkStyle {
    fn default() -> Self {
        Self {
            position: (10, 10),
            font_scale: 1.0,
            color: [255, 255, 255],
            thickness: 2,
        }
    }
}

impl WatermarkStyle {
    pub fn validate(&self) -> Result<()> {
        if !self.font_scale.is_finite() || self.font_scale <= 0.0 {
            return Err(ImageVaultError::InvalidParameter(format!(
                "watermark font_scale must be positive, got {}",
                self.font_scale
            )));
        }
        positive("watermark thickness", self.thickness)?;
        Ok(())
    }

    fn cell_px(&self) -> u32 {
        ((CELL_PX_AT_UNIT_SCALE * self.font_scale).round() as u32).max(1)
    }
}

/// Draw `text` onto the image. Text running past the edges is clipped and
/// empty text leaves the image untouched.
pub fn watermark(image: DynamicImage, text: &str, style: &WatermarkStyle) -> Result<DynamicImage> {
    if text.is_empty() {
        return Ok(image);
    }
    style.validate()?;

    let [r, g, b] = style.color;
    let pen = Pen {
        origin: style.position,
        cell: style.cell_px(),
        stroke: style.thickness - 1,
    };

    let stamped = match image {
        DynamicImage::ImageRgb8(mut canvas) => {
            pen.stamp(&mut canvas, text, Rgb([r, g, b]));
            DynamicImage::ImageRgb8(canvas)
        }
        DynamicImage::ImageLuma8(mut canvas) => {
            pen.stamp(&mut canvas, text, Luma([rgb_to_luma(Rgb([r, g, b]))]));
            DynamicImage::ImageLuma8(canvas)
        }
        DynamicImage::ImageRgba8(mut canvas) => {
            pen.stamp(&mut canvas, text, Rgba([r, g, b, 255]));
            DynamicImage::ImageRgba8(canvas)
        }
        other => {
            let mut canvas = other.to_rgba8();
            pen.stamp(&mut canvas, text, Rgba([r, g, b, 255]));
            DynamicImage::ImageRgba8(canvas)
        }
    };
    Ok(stamped)
}

struct Pen {
    origin: (u32, u32),
    cell: u32,
    stroke: u32,
}

impl Pen {
    fn stamp<P: Pixel>(&self, canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>, text: &str, ink: P) {
        let (width, height) = canvas.dimensions();
        let extent = self.cell.saturating_add(self.stroke);

        for (col, row) in glyphs::lit_cells(text) {
            let x0 = self.origin.0.saturating_add(col.saturating_mul(self.cell));
            let y0 = self.origin.1.saturating_add(row.saturating_mul(self.cell));
            let x1 = x0.saturating_add(extent).min(width);
            let y1 = y0.saturating_add(extent).min(height);
            for y in y0..y1 {
                for x in x0..x1 {
                    canvas.put_pixel(x, y, ink);
                }
            }
        }
    }
}

/// The closed set of color filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Grayscale,
    Sepia,
}

impl FromStr for FilterKind {
    type Err = ImageVaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "grayscale" => Ok(FilterKind::Grayscale),
            "sepia" => Ok(FilterKind::Sepia),
            other => Err(ImageVaultError::UnknownFilter(other.to_string())),
        }
    }
}

impl fmt::Display for FilterKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilterKind::Grayscale => f.write_str("grayscale"),
            FilterKind::Sepia => f.write_str("sepia"),
        }
    }
}

/// `Grayscale` collapses to a single luma channel; `Sepia` mixes RGB through
/// [`SEPIA_MATRIX`] and keeps alpha if the source had it.
pub fn filter(image: DynamicImage, kind: FilterKind) -> Result<DynamicImage> {
    match kind {
        FilterKind::Grayscale => Ok(DynamicImage::ImageLuma8(image.to_luma8())),
        FilterKind::Sepia => {
            let toned = apply_color_matrix(&image.to_rgba8(), &SEPIA_MATRIX)?;
            if image.color().has_alpha() {
                Ok(DynamicImage::ImageRgba8(toned))
            } else {
                Ok(DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(toned).to_rgb8()))
            }
        }
    }
}

fn positive(what: &str, value: u32) -> Result<u32> {
    if value == 0 {
        return Err(ImageVaultError::InvalidParameter(format!(
            "{} must be greater than 0",
            what
        )));
    }
    Ok(value)
}
