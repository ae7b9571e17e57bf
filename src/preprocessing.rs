// src/preprocessing.rs

use anyhow::{ensure, Result};
use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::Array4;

/// Preprocess an RGB frame for model input.
///
/// Resizes to a `size x size` square (no letterboxing, aspect ratio is not
/// preserved), scales pixels to `[0, 1]` and adds the batch axis. Layout is
/// NHWC: `(1, size, size, 3)`.
pub fn preprocess(src: &RgbImage, size: u32) -> Result<Array4<f32>> {
    ensure!(size > 0, "model input size must be positive");
    ensure!(
        src.width() > 0 && src.height() > 0,
        "cannot preprocess an empty {}x{} frame",
        src.width(),
        src.height()
    );

    // Bilinear, same as the resize the detector was trained against
    let resized = if src.dimensions() == (size, size) {
        src.clone()
    } else {
        imageops::resize(src, size, size, FilterType::Triangle)
    };

    let side = size as usize;
    let mut output = Array4::<f32>::zeros((1, side, side, 3));

    for (x, y, pixel) in resized.enumerate_pixels() {
        for c in 0..3 {
            output[[0, y as usize, x as usize, c]] = pixel.0[c] as f32 / 255.0;
        }
    }

    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_preprocess_shape() {
        let src = RgbImage::from_pixel(640, 480, Rgb([128, 128, 128]));
        let result = preprocess(&src, 416).unwrap();
        assert_eq!(result.shape(), &[1, 416, 416, 3]);
    }

    #[test]
    fn test_preprocess_normalizes_to_unit_range() {
        let src = RgbImage::from_pixel(32, 32, Rgb([255, 0, 51]));
        let result = preprocess(&src, 32).unwrap();
        assert_eq!(result[[0, 5, 5, 0]], 1.0);
        assert_eq!(result[[0, 5, 5, 1]], 0.0);
        assert!((result[[0, 5, 5, 2]] - 0.2).abs() < 1e-6);
        assert!(result.iter().all(|v| (0.0..=1.0).contains(v)));
    }

    #[test]
    fn test_preprocess_rejects_empty_frame() {
        let src = RgbImage::new(0, 0);
        assert!(preprocess(&src, 416).is_err());
    }
}
