//! Fixed-magnitude quality touch-ups applied to every generated image.

use image::{DynamicImage, RgbImage};

// Larger values produce visible halos and color shifts.
const UNSHARP_SIGMA: f32 = 1.0;
const UNSHARP_THRESHOLD: i32 = 2;
const SATURATION_FACTOR: f32 = 1.05;

/// Forces RGB, applies a small sharpness boost and a small saturation boost.
pub fn refine(image: DynamicImage) -> RgbImage {
    let mut image = image.unsharpen(UNSHARP_SIGMA, UNSHARP_THRESHOLD).to_rgb8();
    saturate(&mut image, SATURATION_FACTOR);
    image
}

/// Scales each pixel's chroma away from its luma. There is no saturation
/// adjustment in the image crate, so this works on the Rec. 601 luma.
fn saturate(image: &mut RgbImage, factor: f32) {
    for pixel in image.pixels_mut() {
        let [r, g, b] = pixel.0;
        let luma = 0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32;
        pixel.0 = [
            (luma + (r as f32 - luma) * factor).clamp(0.0, 255.0) as u8,
            (luma + (g as f32 - luma) * factor).clamp(0.0, 255.0) as u8,
            (luma + (b as f32 - luma) * factor).clamp(0.0, 255.0) as u8,
        ];
    }
}
