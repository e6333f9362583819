//! Model management for ONNX Runtime
//!
//! Handles downloading, caching, and loading of the PaddleOCR models and the
//! card detector.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use ort::session::{builder::GraphOptimizationLevel, Session};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::error::ModelLoadError;
use crate::storage::image_cache::OFFLINE_ENV;

/// Model files the scanner knows about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelType {
    /// PaddleOCR text detection (DBNet)
    TextDetection,
    /// PaddleOCR text recognition (CRNN)
    TextRecognition,
    /// Character dictionary for recognition
    Dictionary,
    /// Card detector (YOLO export, axis-aligned or oriented boxes)
    CardDetector,
}

impl ModelType {
    /// Get the filename for this model type
    pub fn filename(&self) -> &'static str {
        match self {
            ModelType::TextDetection => "det.onnx",
            ModelType::TextRecognition => "rec.onnx",
            ModelType::Dictionary => "dict.txt",
            ModelType::CardDetector => "card_detector.onnx",
        }
    }

    /// Download URL, if the model is published
    ///
    /// The card detector is trained per installation and must be placed in
    /// the models directory by hand.
    pub fn download_url(&self) -> Option<&'static str> {
        match self {
            ModelType::TextDetection => {
                Some("https://huggingface.co/monkt/paddleocr-onnx/resolve/main/detection/v3/det.onnx")
            }
            ModelType::TextRecognition => {
                Some("https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/rec.onnx")
            }
            ModelType::Dictionary => {
                Some("https://huggingface.co/monkt/paddleocr-onnx/resolve/main/languages/english/dict.txt")
            }
            ModelType::CardDetector => None,
        }
    }

    /// Plausible file size range in bytes
    pub fn expected_size_range(&self) -> (u64, u64) {
        match self {
            ModelType::TextDetection => (2_000_000, 5_000_000),
            ModelType::TextRecognition => (7_000_000, 10_000_000),
            ModelType::Dictionary => (100, 100_000),
            ModelType::CardDetector => (1_000_000, 300_000_000),
        }
    }

    /// Display name for progress reporting
    pub fn display_name(&self) -> &'static str {
        match self {
            ModelType::TextDetection => "Text Detection",
            ModelType::TextRecognition => "Text Recognition",
            ModelType::Dictionary => "Character Dictionary",
            ModelType::CardDetector => "Card Detector",
        }
    }

    /// Models needed by the in-process PaddleOCR engine
    pub fn paddle_models() -> [ModelType; 3] {
        [ModelType::TextDetection, ModelType::TextRecognition, ModelType::Dictionary]
    }
}

/// Model manifest tracking downloaded models
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelManifest {
    pub version: String,
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct ModelInfo {
    pub model_type: String,
    pub filename: String,
    pub size_bytes: u64,
    pub sha256: String,
    pub downloaded_at: u64,
}

impl Default for ModelManifest {
    fn default() -> Self {
        Self {
            version: "1.0.0".to_string(),
            models: Vec::new(),
        }
    }
}

/// Downloads and caches ONNX models
pub struct ModelManager {
    models_dir: PathBuf,
}

impl ModelManager {
    /// Use `<data dir>/models`
    pub fn new() -> Result<Self> {
        let data_dir = crate::storage::get_data_dir()?;
        Self::with_dir(data_dir.join("models"))
    }

    /// Create model manager with custom directory
    pub fn with_dir(models_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&models_dir)
            .with_context(|| format!("Failed to create models dir {:?}", models_dir))?;
        Ok(Self { models_dir })
    }

    /// Get the models directory path
    pub fn models_dir(&self) -> &Path {
        &self.models_dir
    }

    /// Get the path to a specific model file
    pub fn model_path(&self, model_type: ModelType) -> PathBuf {
        self.models_dir.join(model_type.filename())
    }

    /// Present on disk with a plausible size
    pub fn is_model_available(&self, model_type: ModelType) -> bool {
        match std::fs::metadata(self.model_path(model_type)) {
            Ok(metadata) => {
                let (min, max) = model_type.expected_size_range();
                (min..=max).contains(&metadata.len())
            }
            Err(_) => false,
        }
    }

    /// Whether the in-process OCR engine can start
    pub fn are_paddle_models_ready(&self) -> bool {
        ModelType::paddle_models()
            .iter()
            .all(|&m| self.is_model_available(m))
    }

    /// Status of every known model: (type, available, size on disk)
    pub fn get_model_status(&self) -> Vec<(ModelType, bool, Option<u64>)> {
        [
            ModelType::TextDetection,
            ModelType::TextRecognition,
            ModelType::Dictionary,
            ModelType::CardDetector,
        ]
        .iter()
        .map(|&model_type| {
            let size = std::fs::metadata(self.model_path(model_type)).ok().map(|m| m.len());
            (model_type, self.is_model_available(model_type), size)
        })
        .collect()
    }

    /// Path to the model, downloading it first if needed
    pub fn ensure_model(&self, model_type: ModelType) -> Result<PathBuf, ModelLoadError> {
        let path = self.model_path(model_type);

        if self.is_model_available(model_type) {
            debug!("Model {:?} already available at {:?}", model_type, path);
            return Ok(path);
        }

        let Some(url) = model_type.download_url() else {
            return Err(ModelLoadError::Missing(path));
        };

        if std::env::var(OFFLINE_ENV).is_ok() {
            warn!("Offline mode: {} must be placed at {:?}", url, path);
            return Err(ModelLoadError::Missing(path));
        }

        info!("Downloading {} model from {}", model_type.display_name(), url);
        self.download_model(model_type, url)
            .map_err(|e| ModelLoadError::Download(format!("{:#}", e)))?;
        Ok(path)
    }

    /// Resolve the card detector model
    ///
    /// Tries `configured` first, then the default file in the models dir.
    pub fn resolve_card_detector(&self, configured: Option<&Path>) -> Result<PathBuf, ModelLoadError> {
        if let Some(path) = configured {
            if path.is_file() {
                return Ok(path.to_path_buf());
            }
            warn!("Card detector {:?} not found; trying default model", path);
        }
        let default = self.model_path(ModelType::CardDetector);
        if default.is_file() {
            Ok(default)
        } else {
            Err(ModelLoadError::Missing(default))
        }
    }

    fn download_model(&self, model_type: ModelType, url: &str) -> Result<()> {
        let path = self.model_path(model_type);
        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        let hash = rt.block_on(download_file_async(url, &path))?;

        if !self.is_model_available(model_type) {
            anyhow::bail!("Download completed but model verification failed");
        }

        self.update_manifest_for_model(model_type, hash)?;
        info!("Successfully downloaded {} model", model_type.display_name());
        Ok(())
    }

    fn update_manifest_for_model(&self, model_type: ModelType, sha256: String) -> Result<()> {
        let mut manifest = self.load_manifest().unwrap_or_default();
        let metadata = std::fs::metadata(self.model_path(model_type))?;

        let model_info = ModelInfo {
            model_type: format!("{:?}", model_type),
            filename: model_type.filename().to_string(),
            size_bytes: metadata.len(),
            sha256,
            downloaded_at: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };

        if let Some(existing) = manifest.models.iter_mut().find(|m| m.filename == model_info.filename) {
            *existing = model_info;
        } else {
            manifest.models.push(model_info);
        }

        self.save_manifest(&manifest)
    }

    /// Load the model manifest
    pub fn load_manifest(&self) -> Result<ModelManifest> {
        let manifest_path = self.models_dir.join("manifest.json");
        if manifest_path.exists() {
            let content = std::fs::read_to_string(&manifest_path)?;
            Ok(serde_json::from_str(&content)?)
        } else {
            Ok(ModelManifest::default())
        }
    }

    /// Save the model manifest
    pub fn save_manifest(&self, manifest: &ModelManifest) -> Result<()> {
        let manifest_path = self.models_dir.join("manifest.json");
        std::fs::write(manifest_path, serde_json::to_string_pretty(manifest)?)?;
        Ok(())
    }
}

/// Stream `url` to `path` via a temp file; returns the SHA-256 hex digest
async fn download_file_async(url: &str, path: &Path) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(300))
        .build()
        .context("Failed to create HTTP client")?;

    let response = client
        .get(url)
        .send()
        .await
        .context("Failed to send download request")?;

    if !response.status().is_success() {
        anyhow::bail!("Download failed with status {}: {}", response.status(), url);
    }

    debug!("Download size: {:?} bytes", response.content_length());

    let temp_path = path.with_extension("tmp");
    let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;

    let mut hasher = Sha256::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.context("Error reading download stream")?;
        file.write_all(&chunk).context("Failed to write to temp file")?;
        hasher.update(&chunk);
    }
    file.flush().context("Failed to flush temp file")?;
    drop(file);

    std::fs::rename(&temp_path, path).context("Failed to move downloaded file to final location")?;
    Ok(format!("{:x}", hasher.finalize()))
}

/// ONNX Runtime session wrapper
pub struct OnnxSession {
    session: Session,
    input_names: Vec<String>,
    output_names: Vec<String>,
}

impl OnnxSession {
    /// Create a new ONNX session from a model file
    pub fn new(model_path: &Path) -> Result<Self, ModelLoadError> {
        Self::build(model_path, false)
    }

    /// Prefer a GPU execution provider, falling back to CPU
    pub fn new_with_gpu(model_path: &Path) -> Result<Self, ModelLoadError> {
        Self::build(model_path, true)
    }

    fn build(model_path: &Path, gpu: bool) -> Result<Self, ModelLoadError> {
        if !model_path.is_file() {
            return Err(ModelLoadError::Missing(model_path.to_path_buf()));
        }
        info!("Loading ONNX model from {:?} (gpu: {})", model_path, gpu);

        let err = |e: &dyn std::fmt::Display| ModelLoadError::Session {
            path: model_path.to_path_buf(),
            reason: e.to_string(),
        };
        let cpu_builder = || -> Result<ort::session::builder::SessionBuilder, ModelLoadError> {
            Session::builder()
                .map_err(|e| err(&e))?
                .with_optimization_level(GraphOptimizationLevel::Level3)
                .map_err(|e| err(&e))?
                .with_intra_threads(4)
                .map_err(|e| err(&e))
        };

        let builder = cpu_builder()?;

        // DirectML on Windows; other platforms run on CPU
        #[cfg(target_os = "windows")]
        let builder = if gpu {
            use ort::execution_providers::DirectMLExecutionProvider;
            match builder.with_execution_providers([DirectMLExecutionProvider::default().build()]) {
                Ok(b) => {
                    info!("DirectML GPU acceleration enabled");
                    b
                }
                Err(e) => {
                    warn!("DirectML not available, using CPU: {}", e);
                    cpu_builder()?
                }
            }
        } else {
            builder
        };

        #[cfg(not(target_os = "windows"))]
        if gpu {
            debug!("No GPU execution provider on this platform, using CPU");
        }

        let session = builder.commit_from_file(model_path).map_err(|e| err(&e))?;

        let input_names: Vec<String> = session.inputs.iter().map(|i| i.name.clone()).collect();
        let output_names: Vec<String> = session.outputs.iter().map(|o| o.name.clone()).collect();
        info!("Model loaded. Inputs: {:?}, Outputs: {:?}", input_names, output_names);

        Ok(Self {
            session,
            input_names,
            output_names,
        })
    }

    /// Get the underlying session mutably for running inference
    pub fn session_mut(&mut self) -> &mut Session {
        &mut self.session
    }

    /// Get input names
    pub fn input_names(&self) -> &[String] {
        &self.input_names
    }

    /// Get output names
    pub fn output_names(&self) -> &[String] {
        &self.output_names
    }
}
