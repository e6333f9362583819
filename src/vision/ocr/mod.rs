//! OCR engines
//!
//! Every backend implements [`TextEngine`]: image in, text tokens with
//! confidences out, plus a block/line/word layout when the engine exposes
//! geometry. Engines are picked by [`EngineKind`] through an
//! [`EngineRegistry`] built once at startup.

pub mod paddle;
pub mod tesseract;
pub mod worker;

pub use paddle::PaddleEngine;
pub use tesseract::TesseractEngine;
pub use worker::WorkerEngine;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use tracing::info;

use super::models::ModelManager;
use crate::config::EngineSettings;
use crate::error::{EngineError, ScanError};

/// Separator used when joining tokens into raw text
pub const TOKEN_SEPARATOR: &str = " | ";

/// OCR backend identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EngineKind {
    /// PaddleOCR through ONNX Runtime, in-process
    Paddle,
    /// Tesseract command line
    Tesseract,
    /// PaddleOCR in a child process
    PaddleWorker,
}

impl EngineKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineKind::Paddle => "paddle",
            EngineKind::Tesseract => "tesseract",
            EngineKind::PaddleWorker => "paddle-worker",
        }
    }

    /// Engines with a word/line/block layout
    pub fn has_layout(&self) -> bool {
        matches!(self, EngineKind::Tesseract)
    }
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EngineKind {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "paddle" => Ok(EngineKind::Paddle),
            "tesseract" => Ok(EngineKind::Tesseract),
            "paddle-worker" => Ok(EngineKind::PaddleWorker),
            other => Err(EngineError::Unavailable(other.to_string())),
        }
    }
}

/// One recognized text fragment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrToken {
    pub text: String,
    /// 0.0 - 1.0
    pub confidence: f32,
}

impl OcrToken {
    pub fn new(text: impl Into<String>, confidence: f32) -> Self {
        Self {
            text: text.into(),
            confidence,
        }
    }
}

/// Word with its bounding box (x, y, width, height)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayoutWord {
    pub text: String,
    pub confidence: f32,
    pub bbox: (u32, u32, u32, u32),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutLine {
    pub words: Vec<LayoutWord>,
}

impl LayoutLine {
    pub fn text(&self) -> String {
        self.words.iter().map(|w| w.text.as_str()).collect::<Vec<_>>().join(" ")
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LayoutBlock {
    pub lines: Vec<LayoutLine>,
}

impl LayoutBlock {
    pub fn text(&self) -> String {
        self.lines
            .iter()
            .map(|l| l.text())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Blocks, lines and words in reading order
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TextLayout {
    pub blocks: Vec<LayoutBlock>,
}

/// Output of one engine invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OcrOutput {
    pub tokens: Vec<OcrToken>,
    pub layout: Option<TextLayout>,
}

impl OcrOutput {
    pub fn from_tokens(tokens: Vec<OcrToken>) -> Self {
        Self { tokens, layout: None }
    }

    /// Tokens joined with [`TOKEN_SEPARATOR`]
    pub fn raw_text(&self) -> String {
        self.tokens
            .iter()
            .map(|t| t.text.as_str())
            .collect::<Vec<_>>()
            .join(TOKEN_SEPARATOR)
    }

    pub fn texts(&self) -> Vec<String> {
        self.tokens.iter().map(|t| t.text.clone()).collect()
    }

    pub fn confidences(&self) -> Vec<f32> {
        self.tokens.iter().map(|t| t.confidence).collect()
    }
}

/// An OCR backend
pub trait TextEngine: Send + Sync {
    fn kind(&self) -> EngineKind;

    fn run(&self, image: &RgbImage) -> Result<OcrOutput, EngineError>;
}

/// Image written to the temp dir for external programs; removed on drop
pub(crate) struct TempPng {
    path: PathBuf,
}

impl TempPng {
    pub(crate) fn write(image: &RgbImage) -> Result<Self, EngineError> {
        let path = std::env::temp_dir().join(format!("card-scanner-{}.png", uuid::Uuid::new_v4()));
        image
            .save_with_format(&path, image::ImageFormat::Png)
            .map_err(|e| EngineError::Failed(format!("could not write temp image: {}", e)))?;
        Ok(Self { path })
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TempPng {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Loaded engines by kind
#[derive(Default, Clone)]
pub struct EngineRegistry {
    engines: BTreeMap<EngineKind, Arc<dyn TextEngine>>,
}

impl EngineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load every engine enabled in `settings`
    ///
    /// A missing in-process model is fatal here, once, rather than per frame.
    pub fn from_config(settings: &EngineSettings, models: &ModelManager) -> Result<Self, ScanError> {
        let mut registry = Self::new();
        for kind in &settings.enabled {
            let engine: Arc<dyn TextEngine> = match kind {
                EngineKind::Paddle => Arc::new(PaddleEngine::load(models, settings.use_gpu)?),
                EngineKind::Tesseract => Arc::new(TesseractEngine::new(
                    &settings.tesseract_program,
                    &settings.tesseract_language,
                )),
                EngineKind::PaddleWorker => {
                    let program = match &settings.worker_program {
                        Some(p) => p.clone(),
                        None => std::env::current_exe()?,
                    };
                    let mut engine = WorkerEngine::new(program, settings.worker_timeout_ms);
                    if let Some(config) = &settings.worker_config {
                        engine = engine.with_config(config.clone());
                    }
                    Arc::new(engine)
                }
            };
            info!("OCR engine '{}' ready", kind);
            registry.register(engine);
        }
        Ok(registry)
    }

    pub fn register(&mut self, engine: Arc<dyn TextEngine>) {
        self.engines.insert(engine.kind(), engine);
    }

    /// Engine for `kind`, or `Unavailable`
    pub fn get(&self, kind: EngineKind) -> Result<Arc<dyn TextEngine>, EngineError> {
        self.engines
            .get(&kind)
            .cloned()
            .ok_or_else(|| EngineError::Unavailable(kind.to_string()))
    }

    pub fn kinds(&self) -> Vec<EngineKind> {
        self.engines.keys().copied().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.engines.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted engine for pipeline tests

    use super::*;

    pub struct FakeEngine {
        pub kind: EngineKind,
        pub result: Result<OcrOutput, EngineError>,
    }

    impl FakeEngine {
        pub fn tokens(kind: EngineKind, tokens: &[(&str, f32)]) -> Self {
            Self {
                kind,
                result: Ok(OcrOutput::from_tokens(
                    tokens.iter().map(|(t, c)| OcrToken::new(*t, *c)).collect(),
                )),
            }
        }

        pub fn failing(kind: EngineKind, error: EngineError) -> Self {
            Self { kind, result: Err(error) }
        }
    }

    impl TextEngine for FakeEngine {
        fn kind(&self) -> EngineKind {
            self.kind
        }

        fn run(&self, _image: &RgbImage) -> Result<OcrOutput, EngineError> {
            self.result.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::FakeEngine;
    use super::*;

    #[test]
    fn test_engine_kind_tags() {
        assert_eq!(serde_json::to_string(&EngineKind::PaddleWorker).unwrap(), "\"paddle-worker\"");
        assert_eq!("tesseract".parse::<EngineKind>().unwrap(), EngineKind::Tesseract);
        assert_eq!(
            "easyocr".parse::<EngineKind>().unwrap_err(),
            EngineError::Unavailable("easyocr".into())
        );
        for kind in [EngineKind::Paddle, EngineKind::Tesseract, EngineKind::PaddleWorker] {
            assert_eq!(kind.as_str().parse::<EngineKind>().unwrap(), kind);
        }
    }

    #[test]
    fn test_raw_text_joins_tokens() {
        let out = OcrOutput::from_tokens(vec![OcrToken::new("Dark Magician", 0.9), OcrToken::new("LOB-EN005", 0.8)]);
        assert_eq!(out.raw_text(), "Dark Magician | LOB-EN005");
        assert_eq!(out.confidences(), vec![0.9, 0.8]);
    }

    #[test]
    fn test_layout_text() {
        let word = |t: &str| LayoutWord {
            text: t.to_string(),
            confidence: 0.9,
            bbox: (0, 0, 1, 1),
        };
        let block = LayoutBlock {
            lines: vec![
                LayoutLine { words: vec![word("Blue-Eyes"), word("White")] },
                LayoutLine { words: vec![word("Dragon")] },
            ],
        };
        assert_eq!(block.lines[0].text(), "Blue-Eyes White");
        assert_eq!(block.text(), "Blue-Eyes White Dragon");
    }

    #[test]
    fn test_temp_png_removed_on_drop() {
        let img = RgbImage::new(4, 4);
        let temp = TempPng::write(&img).unwrap();
        let path = temp.path().to_path_buf();
        assert!(path.exists());
        drop(temp);
        assert!(!path.exists());
    }

    #[test]
    fn test_registry_lookup() {
        let mut registry = EngineRegistry::new();
        assert!(registry.is_empty());
        registry.register(Arc::new(FakeEngine::tokens(EngineKind::Tesseract, &[("x", 1.0)])));

        assert_eq!(registry.kinds(), vec![EngineKind::Tesseract]);
        assert!(registry.get(EngineKind::Tesseract).is_ok());
        assert_eq!(
            registry.get(EngineKind::Paddle).err(),
            Some(EngineError::Unavailable("paddle".into()))
        );
    }

    #[test]
    fn test_registry_from_config_without_paddle() {
        let dir = tempfile::TempDir::new().unwrap();
        let models = ModelManager::with_dir(dir.path().to_path_buf()).unwrap();
        let settings = EngineSettings {
            enabled: vec![EngineKind::Tesseract, EngineKind::PaddleWorker],
            ..Default::default()
        };
        let registry = EngineRegistry::from_config(&settings, &models).unwrap();
        assert_eq!(registry.kinds(), vec![EngineKind::Tesseract, EngineKind::PaddleWorker]);
    }
}
