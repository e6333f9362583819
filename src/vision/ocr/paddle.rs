//! PaddleOCR through ONNX Runtime
//!
//! Two stages: DB text detection produces a probability map that is
//! thresholded into text boxes, then each box is read by the CRNN
//! recognizer and CTC-decoded against the character dictionary.

use image::{GrayImage, Luma, RgbImage};
use imageproc::contours::{find_contours, BorderType};
use imageproc::distance_transform::Norm;
use imageproc::morphology::dilate;
use ndarray::{ArrayView2, Axis, Ix3, Ix4};
use ort::{inputs, value::TensorRef};
use parking_lot::Mutex;
use std::io::{BufRead, BufReader};
use std::path::Path;
use tracing::{debug, info, warn};

use super::{EngineKind, OcrOutput, OcrToken, TextEngine};
use crate::error::{EngineError, ModelLoadError};
use crate::vision::models::{ModelManager, ModelType, OnnxSession};
use crate::vision::preprocess::{
    crop_box, limit_size, preprocess_for_detection, preprocess_for_recognition, PreprocessConfig,
};

/// Probability above which a pixel counts as text
const DB_THRESHOLD: f32 = 0.3;
/// Mean box probability required to keep a box
const DB_BOX_THRESHOLD: f32 = 0.6;
/// Box expansion factor (offset = area * ratio / perimeter)
const DB_UNCLIP_RATIO: f32 = 1.6;
const DB_MAX_CANDIDATES: usize = 1000;
/// Rows closer than this are read left to right
const LINE_TOLERANCE: f32 = 10.0;
/// Larger inputs are shrunk before detection
const MAX_INPUT_SIDE: u32 = 2000;
const SHRUNK_INPUT_SIDE: u32 = 1600;

/// Text box in image coordinates
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TextBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub score: f32,
}

/// In-process PaddleOCR
pub struct PaddleEngine {
    detector: Mutex<OnnxSession>,
    recognizer: Mutex<OnnxSession>,
    dictionary: Vec<String>,
    config: PreprocessConfig,
}

impl PaddleEngine {
    /// Load (downloading if needed) the detection, recognition and dictionary files
    pub fn load(models: &ModelManager, use_gpu: bool) -> Result<Self, ModelLoadError> {
        let det_path = models.ensure_model(ModelType::TextDetection)?;
        let rec_path = models.ensure_model(ModelType::TextRecognition)?;
        let dict_path = models.ensure_model(ModelType::Dictionary)?;

        let open = |p: &Path| {
            if use_gpu {
                OnnxSession::new_with_gpu(p)
            } else {
                OnnxSession::new(p)
            }
        };

        let dictionary = load_dictionary(&dict_path)?;
        info!("PaddleOCR ready ({} dictionary entries)", dictionary.len());

        Ok(Self {
            detector: Mutex::new(open(&det_path)?),
            recognizer: Mutex::new(open(&rec_path)?),
            dictionary,
            config: PreprocessConfig::default(),
        })
    }

    /// Text boxes in reading order
    pub fn detect(&self, image: &RgbImage) -> Result<Vec<TextBox>, EngineError> {
        let (tensor, scale) = preprocess_for_detection(image, &self.config);

        let pred = {
            let mut session = self.detector.lock();
            let input = TensorRef::from_array_view(&tensor).map_err(failed)?;
            let outputs = session.session_mut().run(inputs![input]).map_err(failed)?;
            let view = outputs[0].try_extract_array::<f32>().map_err(failed)?;
            view.into_owned().into_dimensionality::<Ix4>().map_err(failed)?
        };

        let map = pred.index_axis(Axis(0), 0);
        let map = map.index_axis(Axis(0), 0);
        Ok(db_boxes(map, scale, image.dimensions()))
    }

    /// Read one text line
    pub fn recognize_line(&self, line: &RgbImage) -> Result<(String, f32), EngineError> {
        let tensor = preprocess_for_recognition(line, &self.config);

        let preds = {
            let mut session = self.recognizer.lock();
            let input = TensorRef::from_array_view(&tensor).map_err(failed)?;
            let outputs = session.session_mut().run(inputs![input]).map_err(failed)?;
            let view = outputs[0].try_extract_array::<f32>().map_err(failed)?;
            view.into_owned().into_dimensionality::<Ix3>().map_err(failed)?
        };

        Ok(ctc_decode(preds.index_axis(Axis(0), 0), &self.dictionary))
    }
}

impl TextEngine for PaddleEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Paddle
    }

    fn run(&self, image: &RgbImage) -> Result<OcrOutput, EngineError> {
        let image = limit_size(image, MAX_INPUT_SIDE, SHRUNK_INPUT_SIDE);
        let boxes = self.detect(&image)?;
        debug!("PaddleOCR: {} text boxes", boxes.len());

        let tokens = read_boxes(&image, &boxes, |line| self.recognize_line(line));
        Ok(OcrOutput::from_tokens(tokens))
    }
}

/// Read every box; a box that fails to read is logged and skipped
pub fn read_boxes<F>(image: &RgbImage, boxes: &[TextBox], mut read: F) -> Vec<OcrToken>
where
    F: FnMut(&RgbImage) -> Result<(String, f32), EngineError>,
{
    let mut tokens = Vec::with_capacity(boxes.len());
    for b in boxes {
        let Some(line) = crop_box(image, b.x, b.y, b.width, b.height) else {
            continue;
        };
        let (text, confidence) = match read(&line) {
            Ok(read) => read,
            Err(e) => {
                warn!("PaddleOCR: skipping text box at ({}, {}): {}", b.x, b.y, e);
                continue;
            }
        };
        if !text.trim().is_empty() {
            tokens.push(OcrToken::new(text.trim(), confidence));
        }
    }
    tokens
}

fn failed(e: impl std::fmt::Display) -> EngineError {
    EngineError::Failed(e.to_string())
}

/// Dictionary with the CTC blank at index 0 and a trailing space
pub fn load_dictionary(path: &Path) -> Result<Vec<String>, ModelLoadError> {
    let file = std::fs::File::open(path).map_err(|_| ModelLoadError::Missing(path.to_path_buf()))?;
    let mut dictionary = vec!["blank".to_string()];
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| ModelLoadError::Session {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        dictionary.push(line.trim_end_matches('\r').to_string());
    }
    dictionary.push(" ".to_string());
    Ok(dictionary)
}

/// Greedy CTC decode of a `[time, classes]` map
///
/// Repeats collapse, blanks (index 0) drop out; confidence is the mean
/// probability of the kept steps.
pub fn ctc_decode(preds: ArrayView2<f32>, dictionary: &[String]) -> (String, f32) {
    let mut text = String::new();
    let mut probs = Vec::new();
    let mut previous = None;

    for row in preds.rows() {
        let Some((index, &prob)) = row.iter().enumerate().max_by(|(_, a), (_, b)| a.total_cmp(b)) else {
            continue;
        };
        if index != 0 && previous != Some(index) {
            if let Some(ch) = dictionary.get(index) {
                text.push_str(ch);
                probs.push(prob);
            }
        }
        previous = Some(index);
    }

    let confidence = if probs.is_empty() {
        0.0
    } else {
        probs.iter().sum::<f32>() / probs.len() as f32
    };
    (text, confidence)
}

/// Text boxes from a DB probability map
///
/// `scale` is the detection resize factor (resized / original) and
/// `original` the source image size.
pub fn db_boxes(map: ArrayView2<f32>, scale: f32, original: (u32, u32)) -> Vec<TextBox> {
    let (height, width) = (map.shape()[0], map.shape()[1]);
    if height == 0 || width == 0 || scale <= 0.0 {
        return Vec::new();
    }

    let mask = GrayImage::from_fn(width as u32, height as u32, |x, y| {
        Luma([if map[[y as usize, x as usize]] > DB_THRESHOLD { 255 } else { 0 }])
    });
    let mask = dilate(&mask, Norm::L1, 1);

    let (src_w, src_h) = (original.0 as f32, original.1 as f32);
    let mut boxes = Vec::new();

    for contour in find_contours::<u32>(&mask)
        .iter()
        .filter(|c| c.border_type == BorderType::Outer)
        .take(DB_MAX_CANDIDATES)
    {
        let Some((min_x, min_y, max_x, max_y)) = bounds(contour.points.iter().map(|p| (p.x as f32, p.y as f32)))
        else {
            continue;
        };
        let (w, h) = (max_x - min_x, max_y - min_y);
        if w.min(h) < 3.0 {
            continue;
        }

        let score = mean_score(&map, min_x, min_y, max_x, max_y);
        if score < DB_BOX_THRESHOLD {
            continue;
        }

        // offsetting a rectangle grows every side by the same distance
        let offset = (w * h) * DB_UNCLIP_RATIO / (2.0 * (w + h));
        let x0 = ((min_x - offset) / scale).clamp(0.0, src_w - 1.0);
        let y0 = ((min_y - offset) / scale).clamp(0.0, src_h - 1.0);
        let x1 = ((max_x + offset) / scale).clamp(0.0, src_w - 1.0);
        let y1 = ((max_y + offset) / scale).clamp(0.0, src_h - 1.0);

        if x1 - x0 <= 3.0 || y1 - y0 <= 3.0 {
            continue;
        }
        boxes.push(TextBox {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
            score,
        });
    }

    sort_boxes(boxes)
}

fn bounds(points: impl Iterator<Item = (f32, f32)>) -> Option<(f32, f32, f32, f32)> {
    points.fold(None, |acc, (x, y)| match acc {
        None => Some((x, y, x, y)),
        Some((a, b, c, d)) => Some((a.min(x), b.min(y), c.max(x), d.max(y))),
    })
}

fn mean_score(map: &ArrayView2<f32>, min_x: f32, min_y: f32, max_x: f32, max_y: f32) -> f32 {
    let region = map.slice(ndarray::s![
        min_y as usize..=max_y as usize,
        min_x as usize..=max_x as usize
    ]);
    region.mean().unwrap_or(0.0)
}

/// Top-to-bottom, then left-to-right within a row
pub fn sort_boxes(mut boxes: Vec<TextBox>) -> Vec<TextBox> {
    boxes.sort_by(|a, b| a.y.total_cmp(&b.y).then(a.x.total_cmp(&b.x)));
    for i in 1..boxes.len() {
        let mut j = i;
        while j > 0 && (boxes[j].y - boxes[j - 1].y).abs() < LINE_TOLERANCE && boxes[j].x < boxes[j - 1].x {
            boxes.swap(j, j - 1);
            j -= 1;
        }
    }
    boxes
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn dict() -> Vec<String> {
        ["blank", "A", "B", "C", " "].iter().map(|s| s.to_string()).collect()
    }

    fn one_hot(seq: &[usize], classes: usize) -> Array2<f32> {
        Array2::from_shape_fn((seq.len(), classes), |(t, c)| if seq[t] == c { 0.9 } else { 0.025 })
    }

    #[test]
    fn test_ctc_collapses_repeats_and_blanks() {
        let preds = one_hot(&[1, 1, 0, 1, 2, 2, 0, 3], 5);
        let (text, conf) = ctc_decode(preds.view(), &dict());
        assert_eq!(text, "AABC");
        assert!((conf - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_ctc_all_blank() {
        let preds = one_hot(&[0, 0, 0], 5);
        assert_eq!(ctc_decode(preds.view(), &dict()), (String::new(), 0.0));
    }

    #[test]
    fn test_load_dictionary() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("dict.txt");
        std::fs::write(&path, "a\nb\r\nc\n").unwrap();
        let d = load_dictionary(&path).unwrap();
        assert_eq!(d, vec!["blank", "a", "b", "c", " "]);
        assert!(load_dictionary(&dir.path().join("missing.txt")).is_err());
    }

    #[test]
    fn test_db_boxes_finds_text_region() {
        let mut map = Array2::<f32>::zeros((64, 128));
        map.slice_mut(ndarray::s![20..30, 10..90]).fill(0.95);

        // detection ran at half the original size
        let boxes = db_boxes(map.view(), 0.5, (256, 128));
        assert_eq!(boxes.len(), 1);
        let b = boxes[0];
        assert!(b.x < 20.0 && b.x + b.width > 178.0, "{:?}", b);
        assert!(b.y < 40.0 && b.y + b.height > 58.0, "{:?}", b);
        assert!(b.score > 0.6);
    }

    #[test]
    fn test_db_boxes_drops_weak_regions() {
        let mut map = Array2::<f32>::zeros((64, 64));
        map.slice_mut(ndarray::s![10..20, 10..40]).fill(0.4);
        assert!(db_boxes(map.view(), 1.0, (64, 64)).is_empty());
    }

    #[test]
    fn test_unreadable_box_is_skipped() {
        let image = RgbImage::new(100, 60);
        let b = |x: f32, width: f32| TextBox { x, y: 10.0, width, height: 10.0, score: 1.0 };
        let boxes = [b(0.0, 30.0), b(40.0, 20.0), b(70.0, 25.0)];

        let tokens = read_boxes(&image, &boxes, |line| match line.width() {
            20 => Err(EngineError::Failed("bad line".into())),
            30 => Ok(("LOB-EN001".to_string(), 0.9)),
            _ => Ok(("  Dark Magician ".to_string(), 0.8)),
        });
        assert_eq!(
            tokens,
            vec![OcrToken::new("LOB-EN001", 0.9), OcrToken::new("Dark Magician", 0.8)]
        );
    }

    #[test]
    fn test_sort_boxes_reading_order() {
        let b = |x: f32, y: f32| TextBox { x, y, width: 10.0, height: 5.0, score: 1.0 };
        let sorted = sort_boxes(vec![b(50.0, 102.0), b(0.0, 40.0), b(10.0, 100.0)]);
        let order: Vec<(f32, f32)> = sorted.iter().map(|t| (t.x, t.y)).collect();
        assert_eq!(order, vec![(0.0, 40.0), (10.0, 100.0), (50.0, 102.0)]);
    }
}
