//! Image extractor backed by an OCI registry.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tracing::{debug, info};

use super::layer::{lookup_in_layer_file, LayerLookup};
use super::oci::{OciClient, OciConfig, OciError};
use super::reference::ImageReference;
use super::{ExtractError, ImageError, ImageExtractor};
use crate::fs::{write_atomic, FileSystem};

/// Pulls only the layers needed to find a file, newest first.
pub struct OciImageExtractor {
    client: OciClient,
    max_compressed_size: u64,
    fs: Arc<dyn FileSystem>,
    tmp_dir: PathBuf,
}

impl OciImageExtractor {
    /// Create an extractor writing through `fs`, staging files in `tmp_dir`.
    pub fn new(config: OciConfig, fs: Arc<dyn FileSystem>, tmp_dir: impl Into<PathBuf>) -> Result<Self, OciError> {
        let max_compressed_size = config.max_compressed_size;
        Ok(Self {
            client: OciClient::new(config)?,
            max_compressed_size,
            fs,
            tmp_dir: tmp_dir.into(),
        })
    }

    /// Read a file out of an image.
    pub async fn extract(&self, image: &str, path_in_image: &str) -> Result<Vec<u8>, ExtractError> {
        let start = Instant::now();
        let reference = ImageReference::parse(image)?;
        let manifest = self.client.resolve_manifest(&reference).await?;

        let total_compressed = manifest.total_layer_size();
        if total_compressed > self.max_compressed_size {
            return Err(OciError::TooLarge {
                size: total_compressed,
                limit: self.max_compressed_size,
            }
            .into());
        }

        for (i, layer) in manifest.layers.iter().enumerate().rev() {
            let blob = self.client.ensure_blob(&reference, layer).await?;

            let target = path_in_image.to_string();
            let lookup = tokio::task::spawn_blocking(move || lookup_in_layer_file(&blob, &target)).await??;

            match lookup {
                LayerLookup::Found(data) => {
                    debug!(
                        image = %image,
                        layer = i,
                        digest = %layer.digest,
                        duration_ms = start.elapsed().as_millis(),
                        "Found file in layer"
                    );
                    return Ok(data);
                }
                LayerLookup::Deleted => break,
                LayerLookup::Absent => continue,
            }
        }

        Err(ExtractError::FileNotFound)
    }
}

#[async_trait]
impl ImageExtractor for OciImageExtractor {
    async fn copy_from_image(
        &self,
        image: &str,
        path_in_image: &str,
        dest: &Path,
        mode: u32,
    ) -> Result<(), ImageError> {
        let data = self
            .extract(image, path_in_image)
            .await
            .map_err(|e| ImageError::new(image, path_in_image, dest, e))?;

        write_atomic(self.fs.as_ref(), &self.tmp_dir, dest, &data, mode)
            .await
            .map_err(|e| ImageError::new(image, path_in_image, dest, e))?;

        info!(image = %image, path_in_image = %path_in_image, dest = %dest.display(), "Copied file from image");
        Ok(())
    }
}
