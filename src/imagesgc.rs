//! Garbage collection of container images pulled for test runs.
//!
//! Images are tracked in a small JSON file with the last time a run used
//! them. A collection run removes the least recently used images while the
//! total image size is above the configured maximum, and any image that has
//! not been used for longer than the configured age.

use super::Result;
use crate::docker::{Docker, ImageBusy};
use crate::units::{duration_text, ByteSize};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use eyre::WrapErr;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const CACHE_FILE: &str = "docker-images-gc.json";

const FOUR_WEEKS: Duration = Duration::from_secs(4 * 7 * 24 * 60 * 60);

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ImagesGcConfig {
    /// Whether collection removes anything. Tracking happens regardless.
    pub enabled: bool,
    /// Total size above which images are removed, zero to disable
    pub max_total_size: ByteSize,
    /// Age after which an unused image is removed
    #[serde(deserialize_with = "duration_text::deserialize")]
    pub max_unused: Duration,
}

impl Default for ImagesGcConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            max_total_size: ByteSize(0),
            max_unused: FOUR_WEEKS,
        }
    }
}

/// Local image operations the collector needs.
#[async_trait]
pub trait ImagesGcClient: Send + Sync {
    /// Local images as `repository:tag`
    async fn list_images(&self, cancel: &CancellationToken) -> Result<Vec<String>>;
    /// Fails with [`ImageBusy`] when a container still uses the image
    async fn remove_image(&self, image: &str, cancel: &CancellationToken) -> Result<()>;
    async fn total_images_size(&self, cancel: &CancellationToken) -> Result<ByteSize>;
}

#[async_trait]
impl ImagesGcClient for Docker {
    async fn list_images(&self, cancel: &CancellationToken) -> Result<Vec<String>> {
        Docker::list_images(self, cancel).await
    }

    async fn remove_image(&self, image: &str, cancel: &CancellationToken) -> Result<()> {
        Docker::remove_image(self, image, cancel).await
    }

    async fn total_images_size(&self, cancel: &CancellationToken) -> Result<ByteSize> {
        self.images_disk_usage(cancel).await
    }
}

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcEntry {
    pub image_tag: String,
    pub last_used: DateTime<Utc>,
}

pub struct ImagesGc {
    path: PathBuf,
    images: Vec<GcEntry>,
    clock: Clock,
    client: Arc<dyn ImagesGcClient>,
    config: ImagesGcConfig,
}

impl ImagesGc {
    /// Loads the tracked images from [`CACHE_FILE`] in `cache_dir`.
    pub fn from_cache_dir(
        cache_dir: &Path,
        config: ImagesGcConfig,
        client: Arc<dyn ImagesGcClient>,
    ) -> Result<Self> {
        Self::load(cache_dir.join(CACHE_FILE), config, client)
    }

    /// Loads the tracked images from `path`. A missing file means nothing is
    /// tracked yet.
    pub fn load(path: PathBuf, config: ImagesGcConfig, client: Arc<dyn ImagesGcClient>) -> Result<Self> {
        let images = match std::fs::read(&path) {
            Ok(content) => serde_json::from_slice(&content)
                .wrap_err_with(|| format!("can't decode images GC file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e).wrap_err_with(|| format!("can't read images GC file {}", path.display())),
        };
        Ok(Self {
            path,
            images,
            clock: Arc::new(Utc::now),
            client,
            config,
        })
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn entries(&self) -> &[GcEntry] {
        &self.images
    }

    /// Writes the whole collection, creating parent directories as needed.
    pub fn persist(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .wrap_err_with(|| format!("can't create directory {}", parent.display()))?;
        }
        let content = serde_json::to_vec(&self.images).wrap_err("failed to encode list of images")?;
        std::fs::write(&self.path, content)
            .wrap_err_with(|| format!("can't write images GC file {}", self.path.display()))
    }

    /// Records images about to be pulled.
    ///
    /// Tracked images are marked as used now. Untracked images are only
    /// tracked when they are not present locally yet, so images the user
    /// pulled by other means are never collected.
    pub async fn track<I, S>(&mut self, images: I, cancel: &CancellationToken) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let present = self
            .client
            .list_images(cancel)
            .await
            .wrap_err("failed to list local Docker images")?;
        let now = (self.clock)();
        for image in images {
            let image = image.as_ref();
            if let Some(entry) = self.images.iter_mut().find(|e| e.image_tag == image) {
                entry.last_used = now;
                continue;
            }
            if present.iter().any(|p| p == image) {
                continue;
            }
            self.images.push(GcEntry {
                image_tag: image.to_string(),
                last_used: now,
            });
        }
        Ok(())
    }

    /// Removes images according to the configured limits.
    ///
    /// An image busy in a container stays tracked for a later run. Any other
    /// failure stops the run and keeps every entry not processed yet.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }

        let present = self
            .client
            .list_images(cancel)
            .await
            .wrap_err("failed to list local Docker images")?;

        let max_unused =
            chrono::Duration::from_std(self.config.max_unused).wrap_err("max_unused is out of range")?;
        let cutoff = (self.clock)()
            .checked_sub_signed(max_unused)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let mut size_ok = self.config.max_total_size.bytes() == 0;
        let mut pending = std::mem::take(&mut self.images);
        pending.sort_by_key(|e| e.last_used);

        let mut kept = Vec::with_capacity(pending.len());
        let mut queue = pending.into_iter();
        while let Some(entry) = queue.next() {
            if !size_ok {
                match self.client.total_images_size(cancel).await {
                    Ok(total) => size_ok = total <= self.config.max_total_size,
                    Err(err) => {
                        kept.push(entry);
                        kept.extend(queue);
                        self.images = kept;
                        return Err(err.wrap_err("cannot get total images size"));
                    }
                }
            }

            let evict = !size_ok || entry.last_used < cutoff;
            if !evict || !present.iter().any(|p| *p == entry.image_tag) {
                kept.push(entry);
                continue;
            }

            match self.client.remove_image(&entry.image_tag, cancel).await {
                Ok(()) => info!("Removed image {}", entry.image_tag),
                Err(err) if err.downcast_ref::<ImageBusy>().is_some() => {
                    debug!("Image {} is busy, keeping it for a later run", entry.image_tag);
                    kept.push(entry);
                }
                Err(err) => {
                    let image = entry.image_tag.clone();
                    kept.push(entry);
                    kept.extend(queue);
                    self.images = kept;
                    return Err(err.wrap_err(format!("cannot remove image {image}")));
                }
            }
        }

        self.images = kept;
        Ok(())
    }
}
