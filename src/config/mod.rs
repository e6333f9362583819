//! Scanner Configuration
//!
//! Settings for the scan pipeline stored in TOML format.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::info;

use crate::vision::ocr::EngineKind;

/// Scanner settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScannerConfig {
    /// General settings
    pub general: GeneralConfig,
    /// OCR engine settings
    pub engines: EngineSettings,
    /// Optional filters applied before OCR
    pub preprocessing: OcrPreprocessing,
    /// Card localization thresholds
    pub localization: LocalizationConfig,
    /// Rarity and artwork analysis thresholds
    pub visual: VisualConfig,
    /// Background worker settings
    pub worker: WorkerSettings,
}

/// General scanner settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default scan language (region code, e.g. "EN")
    pub language: String,
    /// Directory holding `card_db*.json` files (defaults to `<data>/catalog`)
    pub catalog_dir: Option<PathBuf>,
    /// Directory for cached card images (defaults to `<data>/images`)
    pub images_dir: Option<PathBuf>,
    /// Directory for ONNX models (defaults to `<data>/models`)
    pub models_dir: Option<PathBuf>,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            language: "EN".to_string(),
            catalog_dir: None,
            images_dir: None,
            models_dir: None,
        }
    }
}

/// OCR engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// Engines loaded at startup
    pub enabled: Vec<EngineKind>,
    /// Size of the thread pool engine invocations run on
    pub max_threads: usize,
    /// Images narrower than this are upscaled before OCR
    pub upscale_min_width: u32,
    /// Width small images are upscaled to
    pub upscale_target_width: u32,
    /// Use GPU execution providers where available
    pub use_gpu: bool,
    /// Deadline for the out-of-process engine
    pub worker_timeout_ms: u64,
    /// Program spawned for the out-of-process engine (defaults to this executable)
    pub worker_program: Option<PathBuf>,
    /// Tesseract executable
    pub tesseract_program: String,
    /// Tesseract language pack(s), e.g. "eng+deu"
    pub tesseract_language: String,
    /// Config file handed to the out-of-process engine; set by `load_config`
    #[serde(skip)]
    pub worker_config: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            enabled: vec![EngineKind::Paddle],
            max_threads: 3,
            upscale_min_width: 1000,
            upscale_target_width: 1600,
            use_gpu: false,
            worker_timeout_ms: 30_000,
            worker_program: None,
            tesseract_program: "tesseract".to_string(),
            tesseract_language: "eng".to_string(),
            worker_config: None,
        }
    }
}

/// Optional image filters applied before OCR
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrPreprocessing {
    /// Master switch
    pub enabled: bool,
    /// Convert to grayscale
    pub grayscale: bool,
    /// Invert colors (light text on dark background)
    pub invert: bool,
    /// Contrast factor (1.0 = unchanged)
    pub contrast: f32,
    /// Sharpen strength (0.0 = off)
    pub sharpen: f32,
}

impl Default for OcrPreprocessing {
    fn default() -> Self {
        Self {
            enabled: false,
            grayscale: false,
            invert: false,
            contrast: 1.0,
            sharpen: 0.0,
        }
    }
}

/// Card localization thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalizationConfig {
    /// Minimum contour / box area in px²
    pub min_area: f32,
    /// Accepted normalized aspect band (short / long side)
    pub aspect_min: f32,
    pub aspect_max: f32,
    /// Upper aspect bound for the white-background strategy
    pub white_bg_aspect_max: f32,
    /// White-background contour area bounds relative to frame area
    pub white_bg_min_area_fraction: f32,
    pub white_bg_max_area_fraction: f32,
    /// Contours examined after central-bias scoring
    pub top_candidates: usize,
    /// Fallback crop height relative to frame height
    pub fallback_height_fraction: f32,
    /// Card detector model (defaults to the managed model file)
    pub detector_model: Option<PathBuf>,
    /// Detector emits oriented boxes
    pub detector_oriented: bool,
    /// Minimum detector confidence
    pub detector_confidence: f32,
}

impl Default for LocalizationConfig {
    fn default() -> Self {
        Self {
            min_area: 25_000.0,
            aspect_min: 0.55,
            aspect_max: 0.85,
            white_bg_aspect_max: 0.95,
            white_bg_min_area_fraction: 0.02,
            white_bg_max_area_fraction: 0.95,
            top_candidates: 5,
            fallback_height_fraction: 0.7,
            detector_model: None,
            detector_oriented: false,
            detector_confidence: 0.25,
        }
    }
}

/// Rarity and artwork analysis thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VisualConfig {
    /// Fraction of name-region pixels in a color band that triggers it
    pub rarity_fraction: f32,
    /// Grayscale stddev above which silver text counts as foil
    pub foil_stddev: f32,
    /// Matches must exceed this count for an artwork hit
    pub artwork_min_matches: usize,
    /// Hamming distance cutoff for descriptor matches
    pub descriptor_max_distance: u32,
    /// FAST corner threshold
    pub fast_threshold: u8,
    /// Keypoints kept per image
    pub max_keypoints: usize,
}

impl Default for VisualConfig {
    fn default() -> Self {
        Self {
            rarity_fraction: 0.10,
            foil_stddev: 50.0,
            artwork_min_matches: 10,
            descriptor_max_distance: 60,
            fast_threshold: 30,
            max_keypoints: 1000,
        }
    }
}

/// Background worker settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Frames buffered before the oldest is dropped
    pub queue_capacity: usize,
    /// Lines kept in the debug log ring
    pub log_capacity: usize,
    /// Queue poll interval; bounds how long `stop()` waits on an idle worker
    pub poll_interval_ms: u64,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            log_capacity: 200,
            poll_interval_ms: 100,
        }
    }
}

/// Load configuration from file
pub fn load_config(path: &Path) -> Result<ScannerConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config {:?}", path))?;
    let mut config: ScannerConfig = toml::from_str(&content)?;
    config.engines.worker_config = Some(path.to_path_buf());
    Ok(config)
}

/// Save configuration to file
pub fn save_config(config: &ScannerConfig, path: &Path) -> Result<()> {
    let content = toml::to_string_pretty(config)?;
    std::fs::write(path, content)?;
    Ok(())
}

/// Load `config.toml` from the platform config directory, or defaults
pub fn load_or_default() -> ScannerConfig {
    if let Ok(config_dir) = crate::storage::get_config_dir() {
        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            match load_config(&config_path) {
                Ok(config) => {
                    info!("Loaded configuration from {:?}", config_path);
                    return config;
                }
                Err(e) => tracing::warn!("Ignoring invalid config {:?}: {:#}", config_path, e),
            }
        }
    }
    info!("Using default configuration");
    ScannerConfig::default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_scanner_config() {
        let config = ScannerConfig::default();

        assert_eq!(config.general.language, "EN");
        assert_eq!(config.engines.enabled, vec![EngineKind::Paddle]);
        assert_eq!(config.engines.upscale_min_width, 1000);
        assert_eq!(config.engines.upscale_target_width, 1600);
        assert_eq!(config.engines.worker_timeout_ms, 30_000);

        assert!((config.localization.min_area - 25_000.0).abs() < f32::EPSILON);
        assert!((config.localization.aspect_min - 0.55).abs() < 1e-6);
        assert!((config.localization.aspect_max - 0.85).abs() < 1e-6);
        assert_eq!(config.localization.top_candidates, 5);

        assert_eq!(config.visual.artwork_min_matches, 10);
        assert_eq!(config.visual.descriptor_max_distance, 60);
        assert_eq!(config.worker.log_capacity, 200);
    }

    #[test]
    fn test_config_serialization_roundtrip() {
        let mut config = ScannerConfig::default();
        config.engines.enabled = vec![EngineKind::Tesseract, EngineKind::PaddleWorker];
        config.general.language = "DE".to_string();

        let toml_str = toml::to_string_pretty(&config).unwrap();
        let parsed: ScannerConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(parsed.general.language, "DE");
        assert_eq!(
            parsed.engines.enabled,
            vec![EngineKind::Tesseract, EngineKind::PaddleWorker]
        );
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let parsed: ScannerConfig = toml::from_str(
            r#"
            [engines]
            enabled = ["tesseract"]
            "#,
        )
        .unwrap();

        assert_eq!(parsed.engines.enabled, vec![EngineKind::Tesseract]);
        assert_eq!(parsed.engines.max_threads, 3);
        assert_eq!(parsed.general.language, "EN");
    }

    #[test]
    fn test_save_and_load_config() {
        let config = ScannerConfig::default();
        let temp_file = NamedTempFile::new().unwrap();

        save_config(&config, temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();

        assert_eq!(config.worker.queue_capacity, loaded.worker.queue_capacity);
        assert_eq!(config.visual.fast_threshold, loaded.visual.fast_threshold);
    }

    #[test]
    fn test_loaded_config_remembers_its_path() {
        assert!(ScannerConfig::default().engines.worker_config.is_none());

        let temp_file = NamedTempFile::new().unwrap();
        save_config(&ScannerConfig::default(), temp_file.path()).unwrap();
        let loaded = load_config(temp_file.path()).unwrap();
        assert_eq!(loaded.engines.worker_config.as_deref(), Some(temp_file.path()));

        let saved = toml::to_string_pretty(&loaded).unwrap();
        assert!(!saved.contains("worker_config"));
    }

    #[test]
    fn test_load_config_invalid_toml() {
        let mut temp_file = NamedTempFile::new().unwrap();
        writeln!(temp_file, "this is not valid toml {{{{").unwrap();

        assert!(load_config(temp_file.path()).is_err());
    }

    #[test]
    fn test_load_config_file_not_found() {
        assert!(load_config(Path::new("/nonexistent/path/config.toml")).is_err());
    }
}
