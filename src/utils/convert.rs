use image::{Rgb, RgbaImage};
use ndarray::{Array2, arr2};

use crate::error::{ImageVaultError, Result};

/// Row-major sepia transform: output channel `i` is `SEPIA_MATRIX[i] · (r, g, b)`.
pub const SEPIA_MATRIX: [[f32; 3]; 3] = [
    [0.393, 0.769, 0.189],
    [0.349, 0.686, 0.168],
    [0.272, 0.534, 0.131],
];

/// Multiply every pixel's RGB vector by `matrix`, clamping to the u8 range.
/// Alpha is carried over untouched.
pub fn apply_color_matrix(image: &RgbaImage, matrix: &[[f32; 3]; 3]) -> Result<RgbaImage> {
    let rgb: Vec<f32> = image
        .pixels()
        .flat_map(|p| [p[0] as f32, p[1] as f32, p[2] as f32])
        .collect();
    let pixels = Array2::from_shape_vec((rgb.len() / 3, 3), rgb)
        .map_err(|e| ImageVaultError::Internal(format!("pixel matrix shape: {}", e)))?;

    // (n x 3) . (3 x 3)^T gives one transformed row per pixel.
    let mixed = pixels.dot(&arr2(matrix).t());

    let mut out = image.clone();
    for (pixel, row) in out.pixels_mut().zip(mixed.rows()) {
        for channel in 0..3 {
            pixel[channel] = row[channel].round().clamp(0.0, 255.0) as u8;
        }
    }
    Ok(out)
}

/// Luma of an 8-bit RGB color per ITU-R BT.601.
pub fn rgb_to_luma(pixel: Rgb<u8>) -> u8 {
    let r = pixel[0] as f32;
    let g = pixel[1] as f32;
    let b = pixel[2] as f32;
    (0.299 * r + 0.587 * g + 0.114 * b).round().clamp(0.0, 255.0) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgba};

    #[test]
    fn test_identity_matrix_is_noop() {
        let identity = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];
        let image = ImageBuffer::from_fn(4, 3, |x, y| Rgba([x as u8 * 50, y as u8 * 70, 9, 77]));

        let out = apply_color_matrix(&image, &identity).unwrap();
        assert_eq!(out, image);
    }

    #[test]
    fn test_sepia_on_known_pixel() {
        let image = ImageBuffer::from_pixel(1, 1, Rgba([100u8, 50, 20, 255]));
        let out = apply_color_matrix(&image, &SEPIA_MATRIX).unwrap();

        // r = 39.3 + 38.45 + 3.78, g = 34.9 + 34.3 + 3.36, b = 27.2 + 26.7 + 2.62
        assert_eq!(out.get_pixel(0, 0), &Rgba([82, 73, 57, 255]));
    }

    #[test]
    fn test_sepia_clamps_white() {
        let image = ImageBuffer::from_pixel(2, 2, Rgba([255u8, 255, 255, 10]));
        let out = apply_color_matrix(&image, &SEPIA_MATRIX).unwrap();

        // 0.272 + 0.534 + 0.131 = 0.937 -> 238.9 for blue; red and green saturate.
        assert_eq!(out.get_pixel(1, 1), &Rgba([255, 255, 239, 10]));
    }

    #[test]
    fn test_empty_image() {
        let image: RgbaImage = ImageBuffer::new(0, 0);
        let out = apply_color_matrix(&image, &SEPIA_MATRIX).unwrap();
        assert_eq!(out.dimensions(), (0, 0));
    }

    #[test]
    fn test_rgb_to_luma() {
        assert_eq!(rgb_to_luma(Rgb([0, 0, 0])), 0);
        assert_eq!(rgb_to_luma(Rgb([255, 255, 255])), 255);
        assert_eq!(rgb_to_luma(Rgb([255, 0, 0])), 76);
    }
}
