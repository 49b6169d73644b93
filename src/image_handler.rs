//! Codec adapter: raw bytes in, `DynamicImage` out, and back again.

use image::codecs::jpeg::JpegEncoder;
use image::{DynamicImage, ImageFormat};
use std::borrow::Cow;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;

use crate::error::{ImageVaultError, Result};

/// JPEG quality used when a request does not name one.
pub const DEFAULT_JPEG_QUALITY: u8 = 90;

/// The closed set of formats the service writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputFormat {
    Jpeg,
    Png,
}

impl OutputFormat {
    /// File extension used for storage keys.
    pub fn extension(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "jpg",
            OutputFormat::Png => "png",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Jpeg => "image/jpeg",
            OutputFormat::Png => "image/png",
        }
    }

    /// Format implied by the extension of a storage key such as `1700000000-a.png`.
    pub fn from_key(key: &str) -> Result<Self> {
        match key.rsplit_once('.') {
            Some((stem, ext)) if !stem.is_empty() => ext.parse(),
            _ => Err(ImageVaultError::UnsupportedFormat(format!(
                "'{}' has no file extension",
                key
            ))),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = ImageVaultError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "jpg" | "jpeg" => Ok(OutputFormat::Jpeg),
            "png" => Ok(OutputFormat::Png),
            other => Err(ImageVaultError::UnsupportedFormat(format!(
                "'{}' (expected jpg, jpeg or png)",
                other
            ))),
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// Load image from bytes (supports PNG, JPEG, BMP, etc.)
pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    image::load_from_memory(bytes).map_err(|e| ImageVaultError::Decode(e.to_string()))
}

/// Identify the container format from the magic bytes without decoding pixels.
pub fn sniff_format(bytes: &[u8]) -> Result<OutputFormat> {
    match image::guess_format(bytes) {
        Ok(ImageFormat::Png) => Ok(OutputFormat::Png),
        Ok(ImageFormat::Jpeg) => Ok(OutputFormat::Jpeg),
        Ok(other) => Err(ImageVaultError::UnsupportedFormat(format!("{:?}", other))),
        Err(e) => Err(ImageVaultError::Decode(e.to_string())),
    }
}

/// Encode an image in `format`. `quality` only applies to JPEG.
pub fn encode(image: &DynamicImage, format: OutputFormat, quality: u8) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    match format {
        OutputFormat::Png => {
            image.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)?;
        }
        OutputFormat::Jpeg => {
            let encoder = JpegEncoder::new_with_quality(&mut buf, quality);
            flatten_for_jpeg(image).write_with_encoder(encoder)?;
        }
    }
    Ok(buf)
}

// JPEG has no alpha channel and no 16-bit samples.
fn flatten_for_jpeg(image: &DynamicImage) -> Cow<'_, DynamicImage> {
    match image {
        DynamicImage::ImageLuma8(_) | DynamicImage::ImageRgb8(_) => Cow::Borrowed(image),
        DynamicImage::ImageLumaA8(_)
        | DynamicImage::ImageLuma16(_)
        | DynamicImage::ImageLumaA16(_) => Cow::Owned(DynamicImage::ImageLuma8(image.to_luma8())),
        _ => Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    fn create_rgba_image(width: u32, height: u32) -> DynamicImage {
        let buffer = ImageBuffer::from_fn(width, height, |x, y| {
            Rgba([(x * 20) as u8, (y * 20) as u8, 128, 200])
        });
        DynamicImage::ImageRgba8(buffer)
    }

    #[test]
    fn test_parse_supported_formats() {
        assert_eq!("jpg".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("JPEG".parse::<OutputFormat>().unwrap(), OutputFormat::Jpeg);
        assert_eq!("png".parse::<OutputFormat>().unwrap(), OutputFormat::Png);
    }

    #[test]
    fn test_parse_rejects_other_formats() {
        for value in ["gif", "webp", "string", ""] {
            let result = value.parse::<OutputFormat>();
            assert!(matches!(result, Err(ImageVaultError::UnsupportedFormat(_))));
        }
    }

    #[test]
    fn test_format_from_key() {
        assert_eq!(OutputFormat::from_key("1700-ab-a.PNG").unwrap(), OutputFormat::Png);
        assert_eq!(OutputFormat::from_key("photo.jpeg").unwrap(), OutputFormat::Jpeg);
        assert!(OutputFormat::from_key("noextension").is_err());
        assert!(OutputFormat::from_key(".png").is_err());
    }

    #[test]
    fn test_decode_garbage_fails() {
        let result = decode(b"definitely not an image");
        assert!(matches!(result, Err(ImageVaultError::Decode(_))));
    }

    #[test]
    fn test_png_encode_decode_keeps_pixels() {
        let image = create_rgba_image(8, 6);
        let bytes = encode(&image, OutputFormat::Png, DEFAULT_JPEG_QUALITY).unwrap();
        assert_eq!(sniff_format(&bytes).unwrap(), OutputFormat::Png);

        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded.to_rgba8(), image.to_rgba8());
    }

    #[test]
    fn test_jpeg_encode_drops_alpha() {
        let image = create_rgba_image(16, 16);
        let bytes = encode(&image, OutputFormat::Jpeg, 80).unwrap();
        assert_eq!(sniff_format(&bytes).unwrap(), OutputFormat::Jpeg);

        let decoded = decode(&bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (16, 16));
        assert!(!decoded.color().has_alpha());
    }

    #[test]
    fn test_content_type_and_extension() {
        assert_eq!(OutputFormat::Jpeg.content_type(), "image/jpeg");
        assert_eq!(OutputFormat::Png.extension(), "png");
        assert_eq!(OutputFormat::Jpeg.to_string(), "jpg");
    }
}
