//! Card localization
//!
//! Finds the card quadrilateral in a raw frame. Three interchangeable
//! strategies:
//! - classic: edge gradient + Otsu + contour analysis with a central bias
//! - white-bg: inverted Otsu for dark cards on a light background
//! - detector: a learned card detector (oriented or axis-aligned boxes)
//!
//! When none of them finds a card, callers use [`Localizer::fallback_crop`].

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::contrast::{otsu_level, threshold, ThresholdType};
use imageproc::distance_transform::Norm;
use imageproc::filter::gaussian_blur_f32;
use imageproc::geometry::{convex_hull, min_area_rect};
use imageproc::map::map_colors2;
use imageproc::morphology::{close, grayscale_dilate, grayscale_erode, Mask};
use imageproc::point::Point as IPoint;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::detection::{CardDetector, Detection};
use super::{card_aspect, normalized_aspect, polygon_area, rectify, Point, Quad, CARD_HEIGHT, CARD_WIDTH};
use crate::config::LocalizationConfig;

/// Sigma matching a 5x5 Gaussian kernel
const BLUR_SIGMA: f32 = 1.1;
/// 5x5 structuring element
const GRADIENT_RADIUS: u8 = 2;
/// One closing pass with a 9x9 square element
const CLOSE_RADIUS: u8 = 4;

/// Localization strategy requested by a scan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreprocessingStrategy {
    #[default]
    #[serde(rename = "classic")]
    Classic,
    #[serde(rename = "detector")]
    Detector,
    #[serde(rename = "white-bg")]
    WhiteBackground,
}

impl PreprocessingStrategy {
    /// Parse a strategy tag (`classic`, `detector`, `white-bg`)
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "classic" => Some(Self::Classic),
            "detector" => Some(Self::Detector),
            "white-bg" => Some(Self::WhiteBackground),
            _ => None,
        }
    }
}

/// How the card region was obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalizationMethod {
    Contour,
    WhiteBackground,
    Detector,
    Fallback,
}

/// A contour that survived the area filter
#[derive(Debug, Clone)]
struct Shape {
    area: f32,
    centroid: Option<Point>,
    rect: Quad,
    aspect: f32,
}

/// Locates cards in frames
pub struct Localizer {
    config: LocalizationConfig,
    detector: Option<CardDetector>,
}

impl Localizer {
    pub fn new(config: LocalizationConfig, detector: Option<CardDetector>) -> Self {
        Self { config, detector }
    }

    /// Whether the detector strategy is backed by a loaded model
    pub fn has_detector(&self) -> bool {
        self.detector.is_some()
    }

    /// Find the card with `strategy`
    pub fn locate(&self, frame: &RgbImage, strategy: PreprocessingStrategy) -> Option<(Quad, LocalizationMethod)> {
        match strategy {
            PreprocessingStrategy::Classic => self
                .locate_contour(frame)
                .map(|q| (q, LocalizationMethod::Contour)),
            PreprocessingStrategy::WhiteBackground => self
                .locate_white_background(frame)
                .map(|q| (q, LocalizationMethod::WhiteBackground)),
            PreprocessingStrategy::Detector => {
                if self.detector.is_none() {
                    warn!("Card detector not loaded; using contour strategy");
                    return self
                        .locate_contour(frame)
                        .map(|q| (q, LocalizationMethod::Contour));
                }
                self.locate_detector(frame)
                    .map(|q| (q, LocalizationMethod::Detector))
            }
        }
    }

    /// Locate and rectify, falling back to the center crop
    pub fn extract_card(
        &self,
        frame: &RgbImage,
        strategy: PreprocessingStrategy,
    ) -> (RgbImage, LocalizationMethod, Option<Quad>) {
        match self.locate(frame, strategy) {
            Some((quad, method)) => (rectify(frame, &quad), method, Some(quad)),
            None => {
                debug!("No card found with {:?}; using center crop", strategy);
                (self.fallback_crop(frame), LocalizationMethod::Fallback, None)
            }
        }
    }

    /// Classic contour strategy
    pub fn locate_contour(&self, frame: &RgbImage) -> Option<Quad> {
        let gray = image::imageops::grayscale(frame);
        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
        let gradient = morphological_gradient(&blurred, GRADIENT_RADIUS);
        let binary = otsu_binary(&gradient, false);
        let closed = close(&binary, Norm::LInf, CLOSE_RADIUS);

        let (w, h) = frame.dimensions();
        let center = (w as f32 / 2.0, h as f32 / 2.0);
        let diagonal = ((w as f32).powi(2) + (h as f32).powi(2)).sqrt();

        let mut shapes: Vec<(f32, Shape)> = external_shapes(&closed)
            .into_iter()
            .filter(|s| s.area > self.config.min_area)
            .map(|s| {
                let dist_norm = match s.centroid {
                    Some((cx, cy)) => ((cx - center.0).powi(2) + (cy - center.1).powi(2)).sqrt() / diagonal,
                    None => 1.0,
                };
                (s.area * (1.0 - 0.5 * dist_norm), s)
            })
            .collect();
        shapes.sort_by(|a, b| b.0.total_cmp(&a.0));

        let (lo, hi) = (self.config.aspect_min, self.config.aspect_max);
        shapes
            .into_iter()
            .take(self.config.top_candidates)
            .map(|(_, s)| s)
            .find(|s| s.aspect > lo && s.aspect < hi)
            .map(|s| {
                debug!("Contour card: area {:.0}, aspect {:.3}", s.area, s.aspect);
                s.rect
            })
    }

    /// Dark card on a light background
    pub fn locate_white_background(&self, frame: &RgbImage) -> Option<Quad> {
        let gray = image::imageops::grayscale(frame);
        let blurred = gaussian_blur_f32(&gray, BLUR_SIGMA);
        let binary = otsu_binary(&blurred, true);
        let closed = close(&binary, Norm::LInf, CLOSE_RADIUS);

        let (w, h) = frame.dimensions();
        let frame_area = w as f32 * h as f32;
        let min_area = frame_area * self.config.white_bg_min_area_fraction;
        let max_area = frame_area * self.config.white_bg_max_area_fraction;

        let mut shapes: Vec<Shape> = external_shapes(&closed)
            .into_iter()
            .filter(|s| s.area > min_area && s.area < max_area)
            .collect();
        shapes.sort_by(|a, b| b.area.total_cmp(&a.area));

        let (lo, hi) = (self.config.aspect_min, self.config.white_bg_aspect_max);
        shapes
            .into_iter()
            .take(self.config.top_candidates)
            .find(|s| s.aspect > lo && s.aspect < hi)
            .map(|s| s.rect)
    }

    /// Learned detector strategy
    pub fn locate_detector(&self, frame: &RgbImage) -> Option<Quad> {
        let detector = self.detector.as_ref()?;
        match detector.detect(frame) {
            Ok(detections) => select_detection(&detections, &self.config),
            Err(e) => {
                warn!("Card detector failed: {:#}", e);
                None
            }
        }
    }

    /// Center crop at the card aspect, resized to the canonical size
    pub fn fallback_crop(&self, frame: &RgbImage) -> RgbImage {
        let (w, h) = frame.dimensions();
        let ar = card_aspect();

        let mut crop_h = (h as f32 * self.config.fallback_height_fraction) as u32;
        let mut crop_w = (crop_h as f32 * ar) as u32;
        if crop_w > w {
            crop_w = (w as f32 * 0.8) as u32;
            crop_h = (crop_w as f32 / ar) as u32;
        }

        let resize = |img: &RgbImage| {
            image::imageops::resize(img, CARD_WIDTH, CARD_HEIGHT, image::imageops::FilterType::Triangle)
        };

        if crop_w == 0 || crop_h == 0 || crop_h > h {
            return resize(frame);
        }

        let x = (w - crop_w) / 2;
        let y = (h - crop_h) / 2;
        let crop = image::imageops::crop_imm(frame, x, y, crop_w, crop_h).to_image();
        resize(&crop)
    }
}

/// Pick the card among detector outputs
///
/// Oriented boxes win when present (largest above the area floor).
/// Otherwise axis-aligned boxes must also pass the aspect band.
pub fn select_detection(detections: &[Detection], config: &LocalizationConfig) -> Option<Quad> {
    let largest = |iter: &mut dyn Iterator<Item = &Detection>| {
        iter.max_by(|a, b| a.area().total_cmp(&b.area()))
            .map(|d| d.quad)
    };

    if detections.iter().any(|d| d.oriented) {
        return largest(&mut detections
            .iter()
            .filter(|d| d.oriented && d.area() > config.min_area));
    }

    largest(&mut detections.iter().filter(|d| {
        let aspect = d.aspect().unwrap_or(0.0);
        d.area() > config.min_area && aspect > config.aspect_min && aspect < config.aspect_max
    }))
}

/// Dilation minus erosion with a square structuring element
fn morphological_gradient(image: &GrayImage, radius: u8) -> GrayImage {
    let mask = Mask::square(radius);
    let dilated = grayscale_dilate(image, &mask);
    let eroded = grayscale_erode(image, &mask);
    map_colors2(&dilated, &eroded, |d, e| Luma([d[0].saturating_sub(e[0])]))
}

/// Otsu threshold to a 0/255 mask; `inverted` marks dark pixels
fn otsu_binary(image: &GrayImage, inverted: bool) -> GrayImage {
    let kind = if inverted {
        ThresholdType::BinaryInverted
    } else {
        ThresholdType::Binary
    };
    threshold(image, otsu_level(image), kind)
}

/// Outer contours of a mask with area, centroid and min-area rectangle
fn external_shapes(mask: &GrayImage) -> Vec<Shape> {
    find_contours::<i32>(mask)
        .into_iter()
        .filter(|c| c.border_type == BorderType::Outer && c.parent.is_none())
        .filter(|c| c.points.len() >= 3)
        .filter_map(|c| {
            let pts: Vec<Point> = c.points.iter().map(|p| (p.x as f32, p.y as f32)).collect();
            let area = polygon_area(&pts);

            let hull = convex_hull(c.points.as_slice());
            let rect = min_area_rect(&hull);
            let rect = to_quad(&rect);
            let side_a = distance(rect.points[0], rect.points[1]);
            let side_b = distance(rect.points[1], rect.points[2]);
            let aspect = normalized_aspect(side_a, side_b)?;

            Some(Shape {
                area,
                centroid: polygon_centroid(&pts),
                rect,
                aspect,
            })
        })
        .collect()
}

fn to_quad(rect: &[IPoint<i32>; 4]) -> Quad {
    Quad::new([
        (rect[0].x as f32, rect[0].y as f32),
        (rect[1].x as f32, rect[1].y as f32),
        (rect[2].x as f32, rect[2].y as f32),
        (rect[3].x as f32, rect[3].y as f32),
    ])
}

fn distance(a: Point, b: Point) -> f32 {
    ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt()
}

/// Area-weighted centroid; `None` for degenerate polygons
fn polygon_centroid(points: &[Point]) -> Option<Point> {
    let mut twice_area = 0.0f32;
    let mut cx = 0.0f32;
    let mut cy = 0.0f32;
    for i in 0..points.len() {
        let (x0, y0) = points[i];
        let (x1, y1) = points[(i + 1) % points.len()];
        let cross = x0 * y1 - x1 * y0;
        twice_area += cross;
        cx += (x0 + x1) * cross;
        cy += (y0 + y1) * cross;
    }
    if twice_area.abs() < f32::EPSILON {
        return None;
    }
    Some((cx / (3.0 * twice_area), cy / (3.0 * twice_area)))
}
