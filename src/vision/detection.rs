//! Learned card detector
//!
//! Runs a YOLO-style ONNX export over the frame. Two output layouts are
//! understood, both `[1, features, anchors]`:
//! - axis-aligned: `cx, cy, w, h, class scores...`
//! - oriented: `cx, cy, w, h, class scores..., angle` (radians)

use anyhow::{Context, Result};
use image::RgbImage;
use ndarray::{ArrayView2, Ix3};
use ort::{inputs, value::TensorRef};
use parking_lot::Mutex;
use std::path::Path;
use tracing::{debug, info};

use super::models::OnnxSession;
use super::preprocess::{preprocess_for_card_detector, PreprocessConfig};
use super::{normalized_aspect, Point, Quad};
use crate::error::ModelLoadError;

/// One detected card box in frame coordinates
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    pub quad: Quad,
    pub confidence: f32,
    pub oriented: bool,
}

impl Detection {
    /// Axis-aligned box from its top-left corner and size
    pub fn axis_aligned(x: f32, y: f32, width: f32, height: f32, confidence: f32) -> Self {
        Self {
            quad: Quad::from_rect(x, y, width, height),
            confidence,
            oriented: false,
        }
    }

    /// Oriented box from its corners
    pub fn oriented(quad: Quad, confidence: f32) -> Self {
        Self {
            quad,
            confidence,
            oriented: true,
        }
    }

    pub fn area(&self) -> f32 {
        self.quad.area()
    }

    /// Short side over long side
    pub fn aspect(&self) -> Option<f32> {
        let [a, b, c, _] = self.quad.points;
        let side = |p: Point, q: Point| ((p.0 - q.0).powi(2) + (p.1 - q.1).powi(2)).sqrt();
        normalized_aspect(side(a, b), side(b, c))
    }
}

/// ONNX card detector
pub struct CardDetector {
    session: Mutex<OnnxSession>,
    oriented: bool,
    confidence: f32,
    preprocess: PreprocessConfig,
}

impl CardDetector {
    /// Load the model at `path`
    ///
    /// `oriented` selects the output layout; `confidence` is the minimum
    /// class score kept.
    pub fn load(path: &Path, oriented: bool, confidence: f32) -> Result<Self, ModelLoadError> {
        let session = OnnxSession::new(path)?;
        info!("Card detector loaded from {:?} (oriented: {})", path, oriented);
        Ok(Self {
            session: Mutex::new(session),
            oriented,
            confidence,
            preprocess: PreprocessConfig::default(),
        })
    }

    /// Detect card boxes in a frame
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<Detection>> {
        let (tensor, factors) = preprocess_for_card_detector(image, &self.preprocess);

        let output = {
            let mut session = self.session.lock();
            let input = TensorRef::from_array_view(&tensor)?;
            let outputs = session
                .session_mut()
                .run(inputs![input])
                .context("Card detector inference failed")?;
            let view = outputs[0].try_extract_array::<f32>()?;
            view.into_owned()
                .into_dimensionality::<Ix3>()
                .context("Unexpected card detector output shape")?
        };

        let detections = parse_detections(
            output.index_axis(ndarray::Axis(0), 0),
            self.oriented,
            self.confidence,
            factors,
        );
        debug!("Card detector: {} boxes above {:.2}", detections.len(), self.confidence);
        Ok(detections)
    }
}

/// Decode a `[features, anchors]` prediction map
///
/// `factors` scale model coordinates back to the frame (x, y).
pub fn parse_detections(
    pred: ArrayView2<f32>,
    oriented: bool,
    min_confidence: f32,
    factors: (f32, f32),
) -> Vec<Detection> {
    let features = pred.shape()[0];
    let class_end = if oriented { features.saturating_sub(1) } else { features };
    if class_end <= 4 {
        return Vec::new();
    }

    let (fx, fy) = factors;
    let mut detections = Vec::new();

    for column in pred.columns() {
        let score = column
            .iter()
            .take(class_end)
            .skip(4)
            .copied()
            .fold(f32::NEG_INFINITY, f32::max);
        if score < min_confidence {
            continue;
        }

        let (cx, cy, w, h) = (column[0], column[1], column[2], column[3]);
        if w <= 0.0 || h <= 0.0 {
            continue;
        }

        if oriented {
            let angle = column[features - 1];
            let corners = rotated_corners(cx, cy, w, h, angle).map(|(x, y)| (x * fx, y * fy));
            detections.push(Detection::oriented(Quad::new(corners), score));
        } else {
            detections.push(Detection::axis_aligned(
                (cx - w / 2.0) * fx,
                (cy - h / 2.0) * fy,
                w * fx,
                h * fy,
                score,
            ));
        }
    }

    detections
}

/// Corners of a rotated box, clockwise from the (unrotated) top-left
fn rotated_corners(cx: f32, cy: f32, w: f32, h: f32, angle: f32) -> [Point; 4] {
    let (sin, cos) = angle.sin_cos();
    let (hw, hh) = (w / 2.0, h / 2.0);
    [(-hw, -hh), (hw, -hh), (hw, hh), (-hw, hh)]
        .map(|(dx, dy)| (cx + dx * cos - dy * sin, cy + dx * sin + dy * cos))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_parse_axis_aligned() {
        // two anchors: one confident card, one below threshold
        let pred = Array2::from_shape_vec(
            (5, 2),
            vec![
                320.0, 100.0, // cx
                320.0, 100.0, // cy
                200.0, 10.0, // w
                300.0, 10.0, // h
                0.9, 0.1, // class 0
            ],
        )
        .unwrap();

        let dets = parse_detections(pred.view(), false, 0.25, (2.0, 1.0));
        assert_eq!(dets.len(), 1);
        let d = &dets[0];
        assert!(!d.oriented);
        assert_eq!(d.quad.points[0], (440.0, 170.0));
        assert!((d.area() - 400.0 * 300.0).abs() < 1e-3);
        assert!((d.aspect().unwrap() - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_parse_oriented_uses_angle() {
        let angle = std::f32::consts::FRAC_PI_2;
        let pred = Array2::from_shape_vec((6, 1), vec![100.0, 100.0, 60.0, 20.0, 0.8, angle]).unwrap();

        let dets = parse_detections(pred.view(), true, 0.5, (1.0, 1.0));
        assert_eq!(dets.len(), 1);
        assert!(dets[0].oriented);
        // rotated by 90 degrees: the first corner moves to (110, 70)
        let (x, y) = dets[0].quad.points[0];
        assert!((x - 110.0).abs() < 1e-3 && (y - 70.0).abs() < 1e-3, "{:?}", (x, y));
        assert!((dets[0].area() - 1200.0).abs() < 1e-2);
    }

    #[test]
    fn test_parse_without_classes() {
        let pred = Array2::<f32>::zeros((4, 3));
        assert!(parse_detections(pred.view(), false, 0.1, (1.0, 1.0)).is_empty());
    }
}
