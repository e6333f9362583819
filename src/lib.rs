//! card-scanner - trading card scan pipeline
//!
//! Localizes a card in a camera frame, rectifies it, reads it with one or
//! more OCR engines, corrects the printed set identifier and matches the
//! result against a card catalog. [`worker::ScanWorker`] runs the pipeline
//! in the background over a live frame feed.

pub mod analysis;
pub mod capture;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod shared;
pub mod storage;
pub mod vision;
pub mod worker;

pub use error::{EngineError, ModelLoadError, ScanError};
pub use pipeline::{ScanOptions, ScanPipeline, ScanReport};
pub use worker::ScanWorker;
