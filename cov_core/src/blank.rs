//! Blank-view detection.
//!
//! When free motion carries the camera outside the reconstructed geometry
//! the renderer returns frames filled with the clear color. Those frames
//! carry no evidence, so the session treats them as a degenerate state.

use image::{DynamicImage, GenericImageView};
use std::path::Path;

/// Default fraction of blank pixels above which a frame is blank.
pub const BLANK_THRESHOLD: f64 = 0.9;

/// Channel value of the renderer's clear color (white).
pub const BLANK_VALUE: u8 = 255;

/// Fraction of pixels equal to the blank color in every color channel.
///
/// With an alpha channel a pixel only counts when it is also fully opaque.
/// An image without pixels has ratio 0.
pub fn blank_ratio(image: &DynamicImage) -> f64 {
    let (width, height) = image.dimensions();
    let total = width as u64 * height as u64;
    if total == 0 {
        return 0.0;
    }

    let blank = match image {
        DynamicImage::ImageLuma8(img) => img.pixels().filter(|p| p[0] == BLANK_VALUE).count(),
        DynamicImage::ImageLumaA8(img) => img
            .pixels()
            .filter(|p| p[0] == BLANK_VALUE && p[1] == u8::MAX)
            .count(),
        DynamicImage::ImageRgb8(img) => img
            .pixels()
            .filter(|p| p.0.iter().all(|&c| c == BLANK_VALUE))
            .count(),
        DynamicImage::ImageRgba8(img) => count_rgba(img),
        other if other.color().has_alpha() => count_rgba(&other.to_rgba8()),
        other => other
            .to_rgb8()
            .pixels()
            .filter(|p| p.0.iter().all(|&c| c == BLANK_VALUE))
            .count(),
    };

    blank as f64 / total as f64
}

fn count_rgba(img: &image::RgbaImage) -> usize {
    img.pixels()
        .filter(|p| p[0] == BLANK_VALUE && p[1] == BLANK_VALUE && p[2] == BLANK_VALUE && p[3] == u8::MAX)
        .count()
}

/// Returns true iff the blank fraction is at or above `threshold`.
pub fn is_blank(image: &DynamicImage, threshold: f64) -> bool {
    blank_ratio(image) >= threshold
}

/// Loads an image file and classifies it.
pub fn is_blank_file(path: &Path, threshold: f64) -> Result<bool, image::ImageError> {
    let image = image::open(path)?;
    Ok(is_blank(&image, threshold))
}
