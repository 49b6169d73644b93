//! Fixed-order transformation pipeline: decode once, run the requested
//! operators on one in-memory image, encode once.

use tracing::{debug, instrument};

use crate::error::Result;
use crate::image_handler::{self, DEFAULT_JPEG_QUALITY, OutputFormat};
use crate::operators::{self, WatermarkStyle};
use crate::spec::TransformationSpec;

/// Encoded pipeline output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedImage {
    pub bytes: Vec<u8>,
    pub format: OutputFormat,
    pub width: u32,
    pub height: u32,
}

/// Run `spec` against `original_bytes` and encode the result.
///
/// Stages run as resize, crop, rotate, watermark, flip, filter; each is
/// skipped when its field is absent. The output format is `spec.format` or,
/// failing that, `original_format`. Any failure discards the working image and nothing is
/// returned, so callers never see a partially transformed result.
#[instrument(skip(original_bytes, spec), fields(input_len = original_bytes.len()))]
pub fn apply(
    original_bytes: &[u8],
    spec: &TransformationSpec,
    original_format: &str,
) -> Result<TransformedImage> {
    // Reject bad requests before paying for a decode.
    spec.validate()?;
    let format = spec.resolve_format(original_format)?;
    let filter = spec.filter_kind()?;

    let mut image = image_handler::decode(original_bytes)?;
    debug!(width = image.width(), height = image.height(), "decoded");

    if let Some(resize) = &spec.resize {
        image = operators::resize(image, resize.width, resize.height)?;
    }
    if let Some(crop) = &spec.crop {
        image = operators::crop(image, crop.x, crop.y, crop.width, crop.height)?;
    }
    if let Some(degrees) = spec.rotate {
        image = operators::rotate(image, degrees)?;
    }
    if let Some(text) = &spec.watermark {
        let default_style = WatermarkStyle::default();
        let style = spec.watermark_style.as_ref().unwrap_or(&default_style);
        image = operators::watermark(image, text, style)?;
    }
    if let Some(axis) = spec.flip {
        image = operators::flip(image, axis);
    }
    if let Some(kind) = filter {
        image = operators::filter(image, kind)?;
    }

    let (width, height) = (image.width(), image.height());
    let bytes = image_handler::encode(
        &image,
        format,
        spec.quality.unwrap_or(DEFAULT_JPEG_QUALITY),
    )?;
    debug!(width, height, %format, output_len = bytes.len(), "encoded");

    Ok(TransformedImage {
        bytes,
        format,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ImageVaultError;
    use crate::spec::{CropSpec, ResizeSpec};
    use image::{DynamicImage, ImageBuffer, Rgb};

    fn create_png_bytes(width: u32, height: u32) -> Vec<u8> {
        let buffer = ImageBuffer::from_fn(width, height, |x, y| {
            Rgb([(x % 256) as u8, (y % 256) as u8, ((x * y) % 256) as u8])
        });
        image_handler::encode(&DynamicImage::ImageRgb8(buffer), OutputFormat::Png, 90).unwrap()
    }

    #[test]
    fn test_empty_spec_keeps_png() {
        let original = create_png_bytes(20, 10);
        let out = apply(&original, &TransformationSpec::default(), "png").unwrap();

        assert_eq!(out.format, OutputFormat::Png);
        assert_eq!(image_handler::sniff_format(&out.bytes).unwrap(), OutputFormat::Png);
        assert_eq!((out.width, out.height), (20, 10));
    }

    #[test]
    fn test_format_override_to_jpeg() {
        let original = create_png_bytes(20, 10);
        let spec = TransformationSpec {
            format: Some("jpg".into()),
            ..TransformationSpec::default()
        };
        let out = apply(&original, &spec, "png").unwrap();

        assert_eq!(out.format, OutputFormat::Jpeg);
        assert_eq!(image_handler::sniff_format(&out.bytes).unwrap(), OutputFormat::Jpeg);
    }

    #[test]
    fn test_crop_uses_resized_coordinates() {
        let original = create_png_bytes(400, 200);
        // After resizing to 100x50, a crop at x=60 width 40 fits exactly.
        let spec = TransformationSpec {
            resize: Some(ResizeSpec { width: Some(100), height: None }),
            crop: Some(CropSpec { x: 60, y: 0, width: 40, height: 50 }),
            ..TransformationSpec::default()
        };
        let out = apply(&original, &spec, "png").unwrap();
        assert_eq!((out.width, out.height), (40, 50));

        // The same crop no longer fits once it is shifted past the resized edge.
        let spec = TransformationSpec {
            crop: Some(CropSpec { x: 61, y: 0, width: 40, height: 50 }),
            ..spec
        };
        let result = apply(&original, &spec, "png");
        assert!(matches!(result, Err(ImageVaultError::InvalidParameter(_))));
    }

    #[test]
    fn test_all_stages_in_order() {
        let original = create_png_bytes(80, 40);
        let spec = TransformationSpec::from_json(
            r#"{
                "resize": {"width": 40, "height": 20},
                "crop": {"x": 0, "y": 0, "width": 30, "height": 20},
                "rotate": 90,
                "watermark": "ok",
                "filter": "grayscale"
            }"#,
        )
        .unwrap();
        let out = apply(&original, &spec, "png").unwrap();

        // 30x20 rotated a quarter turn.
        assert_eq!((out.width, out.height), (20, 30));
        let decoded = image_handler::decode(&out.bytes).unwrap();
        assert!(matches!(decoded, DynamicImage::ImageLuma8(_)));
    }

    #[test]
    fn test_flip_runs_after_watermark() {
        let original = create_png_bytes(60, 30);
        let spec = TransformationSpec::from_json(
            r#"{"watermark": "A", "watermark_style": {"color": [255, 0, 0]}, "flip": "horizontal"}"#,
        )
        .unwrap();
        let out = image_handler::decode(&apply(&original, &spec, "png").unwrap().bytes)
            .unwrap()
            .to_rgb8();

        // 'A' lights (13, 10) from the top-left origin; mirrored it lands at x = 59 - 13.
        assert_eq!(*out.get_pixel(46, 10), Rgb([255, 0, 0]));
        assert_ne!(*out.get_pixel(13, 10), Rgb([255, 0, 0]));
    }

    #[test]
    fn test_oversized_resize_rejected_before_decode() {
        let spec = TransformationSpec::from_json(r#"{"resize": {"width": 4000000000, "height": 4000000000}}"#)
            .unwrap();
        let result = apply(b"not an image", &spec, "png");
        assert!(matches!(result, Err(ImageVaultError::InvalidParameter(_))));
    }

    #[test]
    fn test_unsupported_format_aborts_before_decode() {
        let spec = TransformationSpec {
            format: Some("gif".into()),
            ..TransformationSpec::default()
        };
        // Garbage bytes: the format check must fail first.
        let result = apply(b"not an image", &spec, "png");
        assert!(matches!(result, Err(ImageVaultError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_unsupported_original_without_override() {
        let result = apply(&create_png_bytes(4, 4), &TransformationSpec::default(), "gif");
        assert!(matches!(result, Err(ImageVaultError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_decode_error() {
        let result = apply(b"not an image", &TransformationSpec::default(), "png");
        assert!(matches!(result, Err(ImageVaultError::Decode(_))));
    }

    #[test]
    fn test_output_is_deterministic() {
        let original = create_png_bytes(64, 48);
        let spec = TransformationSpec::from_json(
            r#"{"resize": {"height": 30}, "rotate": 33, "watermark": "same", "filter": "sepia", "format": "jpeg"}"#,
        )
        .unwrap();

        let first = apply(&original, &spec, "png").unwrap();
        let second = apply(&original, &spec, "png").unwrap();
        assert_eq!(first.bytes, second.bytes);
    }
}
