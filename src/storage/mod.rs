//! Storage Layer
//!
//! Read-only card catalog, the local card image cache, and the
//! platform directories both live under.

pub mod catalog;
pub mod image_cache;

pub use catalog::{CatalogCard, CatalogImage, CatalogIndex, CatalogLookup, CatalogVariant};
pub use image_cache::{HttpImageCache, ImageCache};

use anyhow::Result;
use std::path::PathBuf;

fn project_dirs() -> Result<directories::ProjectDirs> {
    directories::ProjectDirs::from("com", "cardscanner", "CardScanner")
        .ok_or_else(|| anyhow::anyhow!("Could not determine project directories"))
}

/// Get the application data directory
pub fn get_data_dir() -> Result<PathBuf> {
    let data_dir = project_dirs()?.data_dir().to_path_buf();
    std::fs::create_dir_all(&data_dir)?;
    Ok(data_dir)
}

/// Get the configuration directory
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = project_dirs()?.config_dir().to_path_buf();
    std::fs::create_dir_all(&config_dir)?;
    Ok(config_dir)
}

/// Directory holding the catalog JSON files
pub fn get_catalog_dir() -> Result<PathBuf> {
    let dir = get_data_dir()?.join("catalog");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// Directory holding cached card images
pub fn get_images_dir() -> Result<PathBuf> {
    let dir = get_data_dir()?.join("images");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}
