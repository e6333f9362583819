//! Frame data structures for incoming camera images

use base64::Engine as _;
use image::RgbImage;
use std::time::Instant;

use crate::error::ScanError;

/// A decoded frame awaiting the pipeline
#[derive(Debug, Clone)]
pub struct Frame {
    /// Decoded RGB pixels
    pub image: RgbImage,
    /// When the frame arrived
    pub timestamp: Instant,
}

impl Frame {
    /// Wrap an already decoded image
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            timestamp: Instant::now(),
        }
    }

    /// Decode encoded image bytes (JPEG, PNG, ...)
    pub fn decode(bytes: &[u8]) -> Result<Self, ScanError> {
        if bytes.is_empty() {
            return Err(ScanError::Decode("empty buffer".to_string()));
        }
        let image = image::load_from_memory(bytes)
            .map_err(|e| ScanError::Decode(e.to_string()))?
            .to_rgb8();
        Ok(Self::new(image))
    }

    /// Decode a base64 payload, with or without a `data:image/...;base64,` header
    pub fn decode_base64(payload: &str) -> Result<Self, ScanError> {
        let bytes = decode_base64_payload(payload)?;
        Self::decode(&bytes)
    }

    /// Get frame dimensions as (width, height)
    pub fn dimensions(&self) -> (u32, u32) {
        self.image.dimensions()
    }
}

/// Strip an optional data-URL header and decode the base64 body
pub fn decode_base64_payload(payload: &str) -> Result<Vec<u8>, ScanError> {
    let body = match payload.split_once(',') {
        Some((_, body)) => body,
        None => payload,
    };
    base64::engine::general_purpose::STANDARD
        .decode(body.trim())
        .map_err(|e| ScanError::Decode(format!("invalid base64: {}", e)))
}
