//! Frame Ingestion Layer
//!
//! Turns incoming image payloads into decoded frames. Besides the direct
//! byte / base64 entry points there is a directory feed that picks up
//! images dropped into a folder, used by the `watch` command.

pub mod frame;

pub use frame::Frame;

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::debug;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp", "webp"];

/// Polls a directory for new image files
pub struct DirectoryFeed {
    dir: PathBuf,
    seen: HashSet<PathBuf>,
}

impl DirectoryFeed {
    /// Watch `dir`; files already present are reported on the first poll
    pub fn new(dir: &Path) -> Result<Self> {
        if !dir.is_dir() {
            anyhow::bail!("Not a directory: {:?}", dir);
        }
        Ok(Self {
            dir: dir.to_path_buf(),
            seen: HashSet::new(),
        })
    }

    /// Image files that appeared since the last poll, oldest name first
    pub fn poll(&mut self) -> Result<Vec<PathBuf>> {
        let entries = std::fs::read_dir(&self.dir)
            .with_context(|| format!("Failed to read {:?}", self.dir))?;

        let mut fresh: Vec<PathBuf> = entries
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| is_image_file(p))
            .filter(|p| !self.seen.contains(p))
            .collect();
        fresh.sort();

        for path in &fresh {
            debug!("New frame file {:?}", path);
            self.seen.insert(path.clone());
        }
        Ok(fresh)
    }
}

fn is_image_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}
