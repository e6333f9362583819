//! Image filters applied before OCR
//!
//! Optional enhancements for low-contrast or glossy card photos. Applied
//! after the upscale step, in a fixed order: contrast, sharpen, grayscale,
//! invert.

use image::{Rgb, RgbImage};
use std::borrow::Cow;
use tracing::debug;

use crate::config::OcrPreprocessing;

/// Apply the configured filters; borrows the input when disabled
pub fn apply_preprocessing<'a>(image: &'a RgbImage, settings: &OcrPreprocessing) -> Cow<'a, RgbImage> {
    if !settings.enabled {
        return Cow::Borrowed(image);
    }

    debug!(
        "OCR preprocessing: grayscale={}, invert={}, contrast={}, sharpen={}",
        settings.grayscale, settings.invert, settings.contrast, settings.sharpen
    );

    let mut result = image.clone();

    if (settings.contrast - 1.0).abs() > 0.01 {
        apply_contrast(&mut result, settings.contrast);
    }
    if settings.sharpen > 0.01 {
        result = apply_sharpen(&result, settings.sharpen);
    }
    if settings.grayscale {
        apply_grayscale(&mut result);
    }
    if settings.invert {
        apply_invert(&mut result);
    }

    Cow::Owned(result)
}

/// Stretch around mid-gray; factor > 1.0 increases contrast
fn apply_contrast(image: &mut RgbImage, factor: f32) {
    for px in image.pixels_mut() {
        for v in px.0.iter_mut() {
            *v = ((*v as f32 - 128.0) * factor + 128.0).clamp(0.0, 255.0) as u8;
        }
    }
}

/// Luminance gray, kept as three channels
fn apply_grayscale(image: &mut RgbImage) {
    for px in image.pixels_mut() {
        let [r, g, b] = px.0;
        let gray = (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32) as u8;
        *px = Rgb([gray, gray, gray]);
    }
}

fn apply_invert(image: &mut RgbImage) {
    for px in image.pixels_mut() {
        px.0 = px.0.map(|v| 255 - v);
    }
}

/// 3x3 cross sharpen; border pixels are copied unchanged
fn apply_sharpen(image: &RgbImage, strength: f32) -> RgbImage {
    let (w, h) = image.dimensions();
    if w < 3 || h < 3 {
        return image.clone();
    }
    let center_weight = 1.0 + 4.0 * strength;

    RgbImage::from_fn(w, h, |x, y| {
        if x == 0 || y == 0 || x == w - 1 || y == h - 1 {
            return *image.get_pixel(x, y);
        }
        let at = |dx: i32, dy: i32, c: usize| {
            image.get_pixel((x as i32 + dx) as u32, (y as i32 + dy) as u32).0[c] as f32
        };
        let mut out = [0u8; 3];
        for (c, v) in out.iter_mut().enumerate() {
            let neighbors = at(0, -1, c) + at(0, 1, c) + at(-1, 0, c) + at(1, 0, c);
            *v = (at(0, 0, c) * center_weight - neighbors * strength).clamp(0.0, 255.0) as u8;
        }
        Rgb(out)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pixel(r: u8, g: u8, b: u8) -> RgbImage {
        RgbImage::from_pixel(1, 1, Rgb([r, g, b]))
    }

    #[test]
    fn test_preprocessing_disabled() {
        let img = pixel(100, 150, 200);
        let result = apply_preprocessing(&img, &OcrPreprocessing::default());
        assert!(matches!(result, Cow::Borrowed(_)));
    }

    #[test]
    fn test_contrast_increase() {
        let mut img = pixel(100, 128, 200);
        apply_contrast(&mut img, 2.0);
        assert_eq!(img.get_pixel(0, 0).0, [72, 128, 255]);
    }

    #[test]
    fn test_grayscale() {
        let mut img = pixel(255, 0, 0);
        apply_grayscale(&mut img);
        assert_eq!(img.get_pixel(0, 0).0, [76, 76, 76]);
    }

    #[test]
    fn test_invert() {
        let mut img = pixel(0, 100, 255);
        apply_invert(&mut img);
        assert_eq!(img.get_pixel(0, 0).0, [255, 155, 0]);
    }

    #[test]
    fn test_sharpen_flat_is_noop() {
        let img = RgbImage::from_pixel(5, 5, Rgb([90, 90, 90]));
        assert_eq!(apply_sharpen(&img, 1.0), img);
    }

    #[test]
    fn test_sharpen_boosts_peak() {
        let mut img = RgbImage::from_pixel(3, 3, Rgb([100, 100, 100]));
        img.put_pixel(1, 1, Rgb([120, 120, 120]));
        let out = apply_sharpen(&img, 0.5);
        // 120 * 3 - 400 * 0.5 = 160
        assert_eq!(out.get_pixel(1, 1).0[0], 160);
    }

    #[test]
    fn test_filters_applied_in_order() {
        let img = pixel(255, 0, 0);
        let settings = OcrPreprocessing {
            enabled: true,
            grayscale: true,
            invert: true,
            ..Default::default()
        };
        let out = apply_preprocessing(&img, &settings);
        assert_eq!(out.get_pixel(0, 0).0, [179, 179, 179]);
    }
}
