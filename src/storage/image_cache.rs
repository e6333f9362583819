//! Local card image cache
//!
//! Card artwork is stored as `<images_dir>/<id>.jpg` (`<id>_small.jpg` for
//! the low-resolution variant) and downloaded on first use.

use anyhow::{Context, Result};
use futures_util::StreamExt;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::runtime::Runtime;
use tracing::{debug, warn};

/// Environment variable that disables all downloads
pub const OFFLINE_ENV: &str = "CARD_SCANNER_OFFLINE";

/// Fetches card artwork into local files
pub trait ImageCache: Send + Sync {
    /// Local path of the image, downloading it if missing
    fn ensure_image(&self, card_id: u64, url: &str, high_res: bool) -> Option<PathBuf>;

    /// Conventional local path of a card's primary image, without IO
    fn image_path_for(&self, card_id: u64) -> PathBuf;
}

/// Image cache backed by HTTP downloads
pub struct HttpImageCache {
    images_dir: PathBuf,
    offline: bool,
}

impl HttpImageCache {
    /// Cache rooted at `images_dir`; honors the offline environment variable
    pub fn new(images_dir: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(&images_dir)
            .with_context(|| format!("Failed to create image directory {:?}", images_dir))?;
        Ok(Self {
            images_dir,
            offline: std::env::var(OFFLINE_ENV).is_ok(),
        })
    }

    /// Force offline mode on or off
    pub fn with_offline(mut self, offline: bool) -> Self {
        self.offline = offline;
        self
    }

    pub fn images_dir(&self) -> &Path {
        &self.images_dir
    }

    fn local_path(&self, card_id: u64, high_res: bool) -> PathBuf {
        if high_res {
            self.images_dir.join(format!("{}.jpg", card_id))
        } else {
            self.images_dir.join(format!("{}_small.jpg", card_id))
        }
    }

    fn download(&self, url: &str, path: &Path) -> Result<()> {
        let rt = Runtime::new().context("Failed to create tokio runtime")?;
        rt.block_on(async {
            let client = reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(30))
                .build()
                .context("Failed to create HTTP client")?;

            let response = client
                .get(url)
                .send()
                .await
                .context("Failed to send image request")?;
            if !response.status().is_success() {
                anyhow::bail!("Image download failed with status {}: {}", response.status(), url);
            }

            let temp_path = path.with_extension("part");
            let mut file = std::fs::File::create(&temp_path).context("Failed to create temp file")?;
            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk.context("Error reading image stream")?;
                file.write_all(&chunk).context("Failed to write image")?;
            }
            file.flush()?;
            drop(file);

            std::fs::rename(&temp_path, path).context("Failed to move image into cache")?;
            Ok::<(), anyhow::Error>(())
        })
    }
}

impl ImageCache for HttpImageCache {
    fn ensure_image(&self, card_id: u64, url: &str, high_res: bool) -> Option<PathBuf> {
        let path = self.local_path(card_id, high_res);
        if path.exists() {
            return Some(path);
        }
        if self.offline || url.is_empty() {
            debug!("Image {} not cached and downloads are disabled", card_id);
            return None;
        }

        match self.download(url, &path) {
            Ok(()) => {
                debug!("Cached image {} at {:?}", card_id, path);
                Some(path)
            }
            Err(e) => {
                warn!("Failed to download image for {}: {:#}", card_id, e);
                None
            }
        }
    }

    fn image_path_for(&self, card_id: u64) -> PathBuf {
        self.local_path(card_id, true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_cached_image_is_returned() {
        let dir = TempDir::new().unwrap();
        let cache = HttpImageCache::new(dir.path().to_path_buf()).unwrap().with_offline(true);
        std::fs::write(dir.path().join("42.jpg"), b"jpeg").unwrap();

        assert_eq!(cache.ensure_image(42, "http://unused", true), Some(dir.path().join("42.jpg")));
    }

    #[test]
    fn test_offline_missing_image() {
        let dir = TempDir::new().unwrap();
        let cache = HttpImageCache::new(dir.path().to_path_buf()).unwrap().with_offline(true);
        assert_eq!(cache.ensure_image(7, "http://example.invalid/7.jpg", false), None);
    }

    #[test]
    fn test_image_path_convention() {
        let dir = TempDir::new().unwrap();
        let cache = HttpImageCache::new(dir.path().to_path_buf()).unwrap();
        assert_eq!(cache.image_path_for(89631139), dir.path().join("89631139.jpg"));
        assert_eq!(cache.local_path(1, false), dir.path().join("1_small.jpg"));
    }
}
