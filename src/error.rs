//! Error types for the scan pipeline
//!
//! Per-task failures are written into the scan report; only initialization
//! failures (models, catalog, config) propagate to the caller.

use std::path::PathBuf;
use thiserror::Error;

/// Failures that abort a single scan task or the scanner's startup
#[derive(Debug, Error)]
pub enum ScanError {
    /// Frame bytes could not be decoded into an image
    #[error("could not decode image: {0}")]
    Decode(String),

    /// A required model failed to load
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),

    /// Catalog file missing or malformed
    #[error("catalog error: {0}")]
    Catalog(String),

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failure of a single OCR engine invocation
///
/// Never aborts a scan; recorded next to the results of the engines that
/// succeeded.
#[derive(Debug, Clone, Error, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum EngineError {
    /// Engine was requested but is not loaded
    #[error("engine '{0}' is not available")]
    Unavailable(String),

    /// Engine ran but reported a failure
    #[error("engine failed: {0}")]
    Failed(String),

    /// Out-of-process engine exceeded its deadline
    #[error("engine timed out after {0} ms")]
    Timeout(u64),

    /// Out-of-process engine exited abnormally
    #[error("engine process crashed: {0}")]
    Crashed(String),

    /// Out-of-process engine returned something that is not the expected JSON
    #[error("malformed engine response: {0}")]
    Protocol(String),
}

/// Model loading failures, raised once at startup
#[derive(Debug, Error)]
pub enum ModelLoadError {
    #[error("model file not found: {0:?}")]
    Missing(PathBuf),

    #[error("failed to create inference session for {path:?}: {reason}")]
    Session { path: PathBuf, reason: String },

    #[error("model download failed: {0}")]
    Download(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_error_display() {
        assert_eq!(
            EngineError::Unavailable("tesseract".to_string()).to_string(),
            "engine 'tesseract' is not available"
        );
        assert_eq!(EngineError::Timeout(30000).to_string(), "engine timed out after 30000 ms");
    }

    #[test]
    fn test_model_error_converts_to_scan_error() {
        let err: ScanError = ModelLoadError::Missing(PathBuf::from("/tmp/x.onnx")).into();
        assert!(matches!(err, ScanError::ModelLoad(_)));
        assert!(err.to_string().contains("x.onnx"));
    }

    #[test]
    fn test_engine_error_serializes_tagged() {
        let json = serde_json::to_string(&EngineError::Crashed("exit 139".into())).unwrap();
        assert_eq!(json, r#"{"kind":"crashed","detail":"exit 139"}"#);
    }
}
