//! Rotation, scaling and placeholder helpers applied after decoding.

use image::imageops::FilterType;
use image::{DynamicImage, Rgb, RgbImage};
use tracing::warn;

/// Normalizes `angle` to one of 0, 90, 180 or 270 degrees.
///
/// Angles that are not a multiple of 90 are rounded to the nearest quarter
/// turn; catalog rotations are always quarter turns.
#[must_use]
pub fn quarter_turns(angle: i32) -> i32 {
    let normalized = angle.rem_euclid(360);
    let rounded = ((normalized + 45) / 90 * 90) % 360;
    if rounded != normalized {
        warn!(angle, rounded, "Rounding rotation to nearest quarter turn");
    }
    rounded
}

/// Rotates `image` clockwise by `angle` degrees.
///
/// Returns the rotated image and whether the width and height swapped.
#[must_use]
pub fn rotate(image: DynamicImage, angle: i32) -> (DynamicImage, bool) {
    match quarter_turns(angle) {
        90 => (image.rotate90(), true),
        180 => (image.rotate180(), false),
        270 => (image.rotate270(), true),
        _ => (image, false),
    }
}

/// Returns true if an image of `size` should be scaled into `bounds`.
///
/// Images smaller than the box in both dimensions are only scaled when
/// `upscale` is set.
#[must_use]
pub fn should_scale(size: (u32, u32), bounds: Option<(u32, u32)>, upscale: bool) -> bool {
    let Some((width, height)) = bounds else {
        return false;
    };
    if size.0 < width && size.1 < height {
        return upscale;
    }
    true
}

/// Calculates dimensions that fit `size` within `bounds` keeping aspect ratio.
///
/// The constrained edge takes the box size exactly; the other edge is rounded
/// half up and never drops below one pixel.
#[must_use]
pub fn fit_dimensions(size: (u32, u32), bounds: (u32, u32)) -> (u32, u32) {
    let (width, height) = (u64::from(size.0), u64::from(size.1));
    let (max_width, max_height) = (u64::from(bounds.0), u64::from(bounds.1));
    if width == 0 || height == 0 || max_width == 0 || max_height == 0 {
        return (0, 0);
    }

    let scaled = |numerator: u64, denominator: u64, limit: u64| -> u32 {
        let value = (2 * numerator + denominator) / (2 * denominator);
        u32::try_from(value.clamp(1, limit)).unwrap_or(u32::MAX)
    };

    if width * max_height >= height * max_width {
        (bounds.0, scaled(height * max_width, width, max_height))
    } else {
        (scaled(width * max_height, height, max_width), bounds.1)
    }
}

/// Scales `image` to fit within `bounds` preserving aspect ratio.
#[must_use]
pub fn scale_to_fit(image: &DynamicImage, bounds: (u32, u32)) -> DynamicImage {
    let (width, height) = fit_dimensions((image.width(), image.height()), bounds);
    if (width, height) == (image.width(), image.height()) || width == 0 {
        return image.clone();
    }
    image.resize_exact(width, height, FilterType::Triangle)
}

/// Draws the generic "broken file" image of the given size.
///
/// A light gray tile with a darker border and a cross through it.
#[must_use]
pub fn broken_image(width: u32, height: u32) -> DynamicImage {
    const FILL: Rgb<u8> = Rgb([0xd8, 0xd8, 0xd8]);
    const INK: Rgb<u8> = Rgb([0x80, 0x80, 0x80]);

    let width = width.max(1);
    let height = height.max(1);
    let mut canvas = RgbImage::from_pixel(width, height, FILL);

    for x in 0..width {
        canvas.put_pixel(x, 0, INK);
        canvas.put_pixel(x, height - 1, INK);
    }
    for y in 0..height {
        canvas.put_pixel(0, y, INK);
        canvas.put_pixel(width - 1, y, INK);
    }

    let steps = width.max(height);
    for step in 0..steps {
        let x = u32::try_from(u64::from(step) * u64::from(width) / u64::from(steps))
            .unwrap_or(width - 1);
        let y = u32::try_from(u64::from(step) * u64::from(height) / u64::from(steps))
            .unwrap_or(height - 1);
        canvas.put_pixel(x, y, INK);
        canvas.put_pixel(width - 1 - x, y, INK);
    }

    DynamicImage::ImageRgb8(canvas)
}
