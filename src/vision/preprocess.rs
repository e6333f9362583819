//! Image preprocessing for the ONNX models
//!
//! Resizing, normalization, and tensor conversion for the PaddleOCR models
//! and the card detector, plus the OCR upscale step.

use image::imageops::{self, FilterType};
use image::RgbImage;
use ndarray::{Array3, Array4};
use std::borrow::Cow;

/// Preprocessing configuration
#[derive(Debug, Clone)]
pub struct PreprocessConfig {
    /// Longest side for the detection model
    pub det_target_size: u32,
    /// Fixed input height of the recognition model
    pub rec_target_height: u32,
    /// Maximum width for recognition
    pub rec_max_width: u32,
    /// Square input size of the card detector
    pub card_detector_size: u32,
    /// Mean values for normalization [R, G, B]
    pub mean: [f32; 3],
    /// Std values for normalization [R, G, B]
    pub std: [f32; 3],
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        Self {
            det_target_size: 960,
            rec_target_height: 48,
            rec_max_width: 640,
            card_detector_size: 640,
            // maps [0, 255] to [-1, 1]
            mean: [0.5, 0.5, 0.5],
            std: [0.5, 0.5, 0.5],
        }
    }
}

/// Convert an RGB image to an HWC array scaled to 0-1
pub fn rgb_to_array(image: &RgbImage) -> Array3<f32> {
    let (w, h) = image.dimensions();
    Array3::from_shape_fn((h as usize, w as usize, 3), |(y, x, c)| {
        image.get_pixel(x as u32, y as u32).0[c] as f32 / 255.0
    })
}

/// Normalize image with mean and std
pub fn normalize(image: &Array3<f32>, mean: &[f32; 3], std: &[f32; 3]) -> Array3<f32> {
    let mut out = image.clone();
    for ((_, _, c), v) in out.indexed_iter_mut() {
        *v = (*v - mean[c]) / std[c];
    }
    out
}

/// Convert HWC image to NCHW tensor (batch size 1)
pub fn hwc_to_nchw(image: &Array3<f32>) -> Array4<f32> {
    let (h, w, c) = image.dim();
    Array4::from_shape_fn((1, c, h, w), |(_, ch, y, x)| image[[y, x, ch]])
}

/// Detection input: longest side `det_target_size`, zero-padded to multiples of 32
///
/// Returns the tensor and the resize scale (resized / original).
pub fn preprocess_for_detection(image: &RgbImage, config: &PreprocessConfig) -> (Array4<f32>, f32) {
    let (w, h) = image.dimensions();
    let scale = config.det_target_size as f32 / w.max(h).max(1) as f32;
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);
    let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

    let padded_w = new_w.div_ceil(32) * 32;
    let padded_h = new_h.div_ceil(32) * 32;
    let mut padded = Array3::<f32>::zeros((padded_h as usize, padded_w as usize, 3));
    let normalized = normalize(&rgb_to_array(&resized), &config.mean, &config.std);
    padded
        .slice_mut(ndarray::s![..new_h as usize, ..new_w as usize, ..])
        .assign(&normalized);

    (hwc_to_nchw(&padded), scale)
}

/// Recognition input: fixed height, width scaled and capped
pub fn preprocess_for_recognition(image: &RgbImage, config: &PreprocessConfig) -> Array4<f32> {
    let (w, h) = image.dimensions();
    let scale = config.rec_target_height as f32 / h.max(1) as f32;
    let new_w = ((w as f32 * scale) as u32).clamp(1, config.rec_max_width);
    let resized = imageops::resize(image, new_w, config.rec_target_height, FilterType::Triangle);
    hwc_to_nchw(&normalize(&rgb_to_array(&resized), &config.mean, &config.std))
}

/// Card detector input: plain square resize, 0-1 scaling
///
/// Returns the tensor and the (x, y) factors mapping model coordinates back
/// to the frame.
pub fn preprocess_for_card_detector(image: &RgbImage, config: &PreprocessConfig) -> (Array4<f32>, (f32, f32)) {
    let size = config.card_detector_size;
    let (w, h) = image.dimensions();
    let resized = imageops::resize(image, size, size, FilterType::Triangle);
    let factors = (w as f32 / size as f32, h as f32 / size as f32);
    (hwc_to_nchw(&rgb_to_array(&resized)), factors)
}

/// Upscale narrow images before OCR
///
/// Images narrower than `min_width` are resized to `target_width` with the
/// aspect ratio kept; anything else is borrowed unchanged.
pub fn upscale_for_ocr(image: &RgbImage, min_width: u32, target_width: u32) -> Cow<'_, RgbImage> {
    let (w, h) = image.dimensions();
    if w == 0 || w >= min_width {
        return Cow::Borrowed(image);
    }
    let scale = target_width as f32 / w as f32;
    let new_h = ((h as f32 * scale) as u32).max(1);
    Cow::Owned(imageops::resize(image, target_width, new_h, FilterType::CatmullRom))
}

/// Cap the longest side, keeping the aspect ratio
pub fn limit_size(image: &RgbImage, max_side: u32, target_side: u32) -> Cow<'_, RgbImage> {
    let (w, h) = image.dimensions();
    let longest = w.max(h);
    if longest <= max_side {
        return Cow::Borrowed(image);
    }
    let scale = target_side as f32 / longest as f32;
    let new_w = ((w as f32 * scale) as u32).max(1);
    let new_h = ((h as f32 * scale) as u32).max(1);
    Cow::Owned(imageops::resize(image, new_w, new_h, FilterType::Triangle))
}

/// Copy an axis-aligned box out of an image, clamped to its bounds
pub fn crop_box(image: &RgbImage, x: f32, y: f32, width: f32, height: f32) -> Option<RgbImage> {
    let (img_w, img_h) = image.dimensions();
    let x0 = (x.max(0.0) as u32).min(img_w);
    let y0 = (y.max(0.0) as u32).min(img_h);
    let x1 = ((x + width).max(0.0).ceil() as u32).min(img_w);
    let y1 = ((y + height).max(0.0).ceil() as u32).min(img_h);
    if x1 <= x0 || y1 <= y0 {
        return None;
    }
    Some(imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    #[test]
    fn test_rgb_to_array() {
        let mut img = RgbImage::new(2, 2);
        img.put_pixel(0, 0, Rgb([255, 0, 0]));
        img.put_pixel(1, 0, Rgb([0, 255, 0]));

        let rgb = rgb_to_array(&img);
        assert_eq!(rgb.dim(), (2, 2, 3));
        assert!((rgb[[0, 0, 0]] - 1.0).abs() < 0.01);
        assert!(rgb[[0, 0, 1]].abs() < 0.01);
        assert!((rgb[[0, 1, 1]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_hwc_to_nchw() {
        let hwc = Array3::<f32>::from_shape_fn((10, 20, 3), |(h, w, c)| (h * 100 + w * 10 + c) as f32);
        let nchw = hwc_to_nchw(&hwc);
        assert_eq!(nchw.dim(), (1, 3, 10, 20));
        assert_eq!(nchw[[0, 1, 5, 10]], hwc[[5, 10, 1]]);
    }

    #[test]
    fn test_normalize() {
        let image = Array3::<f32>::from_elem((2, 2, 3), 0.5);
        let normalized = normalize(&image, &[0.485, 0.456, 0.406], &[0.229, 0.224, 0.225]);
        assert!((normalized[[0, 0, 0]] - (0.5 - 0.485) / 0.229).abs() < 0.01);
    }

    #[test]
    fn test_detection_input_padded_to_32() {
        let img = RgbImage::from_pixel(1000, 500, Rgb([255, 255, 255]));
        let (tensor, scale) = preprocess_for_detection(&img, &PreprocessConfig::default());
        assert!((scale - 0.96).abs() < 1e-6);
        assert_eq!(tensor.dim(), (1, 3, 480, 960));
        assert!((tensor[[0, 0, 0, 0]] - 1.0).abs() < 0.01);
    }

    #[test]
    fn test_recognition_width_capped() {
        let img = RgbImage::new(4000, 40);
        let tensor = preprocess_for_recognition(&img, &PreprocessConfig::default());
        assert_eq!(tensor.dim(), (1, 3, 48, 640));
    }

    #[test]
    fn test_card_detector_input_square() {
        let img = RgbImage::new(1280, 720);
        let (tensor, (fx, fy)) = preprocess_for_card_detector(&img, &PreprocessConfig::default());
        assert_eq!(tensor.dim(), (1, 3, 640, 640));
        assert!((fx - 2.0).abs() < 1e-6);
        assert!((fy - 1.125).abs() < 1e-6);
    }

    #[test]
    fn test_upscale_for_ocr() {
        let small = RgbImage::new(800, 400);
        let up = upscale_for_ocr(&small, 1000, 1600);
        assert_eq!(up.dimensions(), (1600, 800));

        let big = RgbImage::new(1200, 400);
        assert!(matches!(upscale_for_ocr(&big, 1000, 1600), Cow::Borrowed(_)));
    }

    #[test]
    fn test_limit_size() {
        let img = RgbImage::new(3000, 1500);
        assert_eq!(limit_size(&img, 2000, 1600).dimensions(), (1600, 800));
        let img = RgbImage::new(1000, 500);
        assert!(matches!(limit_size(&img, 2000, 1600), Cow::Borrowed(_)));
    }

    #[test]
    fn test_crop_box_clamps() {
        let img = RgbImage::new(100, 100);
        assert_eq!(crop_box(&img, 90.0, 90.0, 50.0, 50.0).unwrap().dimensions(), (10, 10));
        assert!(crop_box(&img, 120.0, 0.0, 5.0, 5.0).is_none());
    }
}
