//! Vision Layer
//!
//! Finds the card in a frame, rectifies it to the canonical card size and
//! runs OCR and visual analysis over it. OCR backends:
//! - PaddleOCR via ONNX Runtime (in-process)
//! - PaddleOCR in a child process (isolated from native crashes)
//! - Tesseract CLI (word/line/block geometry)

pub mod artwork;
pub mod detection;
pub mod localize;
pub mod models;
pub mod ocr;
pub mod ocr_preprocess;
pub mod preprocess;
pub mod recognizer;
pub mod rectify;
pub mod visual;

pub use localize::{LocalizationMethod, Localizer, PreprocessingStrategy};
pub use models::{ModelManager, ModelType, OnnxSession};
pub use recognizer::{RecognitionResult, Recognizer, Scope};
pub use rectify::rectify;

use image::{GrayImage, RgbImage};
use imageproc::filter::laplacian_filter;
use serde::{Deserialize, Serialize};

/// Canonical card width after rectification
pub const CARD_WIDTH: u32 = 600;
/// Canonical card height after rectification
pub const CARD_HEIGHT: u32 = 875;

/// Width / height of the canonical card
pub fn card_aspect() -> f32 {
    CARD_WIDTH as f32 / CARD_HEIGHT as f32
}

/// Axis-aligned region on the canonical card
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Roi {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Roi {
    pub const fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    /// Clamp to an image of `width` x `height`; `None` if nothing is left
    fn clamped(&self, width: u32, height: u32) -> Option<Roi> {
        if self.x >= width || self.y >= height {
            return None;
        }
        let w = self.width.min(width - self.x);
        let h = self.height.min(height - self.y);
        (w > 0 && h > 0).then_some(Roi::new(self.x, self.y, w, h))
    }

    /// Copy this region out of an RGB image (clamped to its bounds)
    pub fn crop(&self, image: &RgbImage) -> Option<RgbImage> {
        let r = self.clamped(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image())
    }

    /// Copy this region out of a grayscale image (clamped to its bounds)
    pub fn crop_gray(&self, image: &GrayImage) -> Option<GrayImage> {
        let r = self.clamped(image.width(), image.height())?;
        Some(image::imageops::crop_imm(image, r.x, r.y, r.width, r.height).to_image())
    }
}

/// Set code area (right side, below the artwork)
pub const ROI_SET_ID: Roi = Roi::new(300, 580, 290, 80);
/// "1st Edition" marker (left side, below the artwork)
pub const ROI_FIRST_EDITION: Roi = Roi::new(20, 595, 180, 45);
/// Card text box
pub const ROI_DESCRIPTION: Roi = Roi::new(35, 650, 530, 180);
/// Artwork
pub const ROI_ART: Roi = Roi::new(50, 110, 500, 490);
/// Title bar
pub const ROI_NAME: Roi = Roi::new(30, 25, 480, 50);

/// 2D point in frame pixels
pub type Point = (f32, f32);

/// Four corners of a card in a frame, in no particular order
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quad {
    pub points: [Point; 4],
}

impl Quad {
    pub fn new(points: [Point; 4]) -> Self {
        Self { points }
    }

    /// Axis-aligned rectangle, corners clockwise from top-left
    pub fn from_rect(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self::new([
            (x, y),
            (x + width, y),
            (x + width, y + height),
            (x, y + height),
        ])
    }

    /// Polygon area (shoelace)
    pub fn area(&self) -> f32 {
        polygon_area(&self.points)
    }
}

/// Unsigned area of a closed polygon
pub fn polygon_area(points: &[Point]) -> f32 {
    if points.len() < 3 {
        return 0.0;
    }
    let mut twice = 0.0f32;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        twice += x0 * y1 - x1 * y0;
    }
    twice.abs() / 2.0
}

/// Short side over long side, so always in (0, 1]
pub fn normalized_aspect(width: f32, height: f32) -> Option<f32> {
    if width <= 0.0 || height <= 0.0 {
        return None;
    }
    let ar = width / height;
    Some(if ar > 1.0 { 1.0 / ar } else { ar })
}

/// Variance of the Laplacian; low values mean a blurry image
pub fn blur_score(gray: &GrayImage) -> f64 {
    if gray.width() == 0 || gray.height() == 0 {
        return 0.0;
    }
    let laplacian = laplacian_filter(gray);
    let n = (gray.width() * gray.height()) as f64;
    let (sum, sum_sq) = laplacian.pixels().fold((0.0f64, 0.0f64), |(sum, sum_sq), p| {
        let v = p.0[0] as f64;
        (sum + v, sum_sq + v * v)
    });
    let mean = sum / n;
    sum_sq / n - mean * mean
}

/// Laplacian variance below which a frame counts as blurry
pub const BLUR_THRESHOLD: f64 = 100.0;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rois_fit_canonical_card() {
        for roi in [ROI_SET_ID, ROI_FIRST_EDITION, ROI_DESCRIPTION, ROI_ART, ROI_NAME] {
            assert!(roi.x + roi.width <= CARD_WIDTH, "{:?}", roi);
            assert!(roi.y + roi.height <= CARD_HEIGHT, "{:?}", roi);
        }
    }

    #[test]
    fn test_roi_crop_clamps() {
        let img = RgbImage::new(100, 50);
        let crop = Roi::new(80, 40, 50, 50).crop(&img).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
        assert!(Roi::new(100, 0, 5, 5).crop(&img).is_none());
    }

    #[test]
    fn test_quad_area() {
        let q = Quad::from_rect(10.0, 10.0, 200.0, 300.0);
        assert!((q.area() - 60_000.0).abs() < 1e-3);
    }

    #[test]
    fn test_normalized_aspect() {
        assert!((normalized_aspect(300.0, 600.0).unwrap() - 0.5).abs() < 1e-6);
        assert!((normalized_aspect(600.0, 300.0).unwrap() - 0.5).abs() < 1e-6);
        assert!(normalized_aspect(0.0, 10.0).is_none());
    }

    #[test]
    fn test_blur_score() {
        let flat = GrayImage::from_pixel(32, 32, image::Luma([128]));
        assert_eq!(blur_score(&flat), 0.0);

        let checker = GrayImage::from_fn(32, 32, |x, y| image::Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert!(blur_score(&checker) > BLUR_THRESHOLD);
    }
}
