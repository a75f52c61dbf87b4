//! Writing and removing managed files.

use std::path::Path;

use gardener_osc::{ContentSource, File};
use tracing::{debug, info};

use super::{Applier, ApplyError};
use crate::fs::write_atomic;

impl Applier {
    /// Write changed files with inline content.
    ///
    /// Files are staged in `tmp_dir` and renamed onto their target.
    pub async fn apply_inline_files(&self, tmp_dir: &Path, files: &[File]) -> Result<(), ApplyError> {
        for file in files {
            let Some(ContentSource::Inline(inline)) = file.content.source() else {
                continue;
            };

            let data = inline.decode().map_err(|source| ApplyError::Decode {
                path: file.path.clone(),
                source,
            })?;

            write_atomic(self.fs.as_ref(), tmp_dir, Path::new(&file.path), &data, file.mode())
                .await
                .map_err(|source| ApplyError::WriteFile {
                    path: file.path.clone(),
                    source,
                })?;

            let mode = format!("{:o}", file.mode());
            info!(path = %file.path, mode = %mode, "Wrote file");
        }
        Ok(())
    }

    /// Copy changed files whose content lives in a container image.
    pub async fn apply_image_ref_files(&self, files: &[File]) -> Result<(), ApplyError> {
        for file in files {
            match file.content.source() {
                Some(ContentSource::ImageRef(image_ref)) => {
                    self.images
                        .copy_from_image(
                            &image_ref.image,
                            &image_ref.file_path_in_image,
                            Path::new(&file.path),
                            file.mode(),
                        )
                        .await?;
                }
                Some(ContentSource::Inline(_)) => {}
                None => {
                    return Err(ApplyError::MissingContent {
                        path: file.path.clone(),
                    })
                }
            }
        }
        Ok(())
    }

    /// Remove files that are no longer part of the configuration.
    pub async fn remove_deleted_files(&self, files: &[File]) -> Result<(), ApplyError> {
        for file in files {
            self.fs
                .remove_file(Path::new(&file.path))
                .await
                .map_err(|source| ApplyError::RemoveFile {
                    path: file.path.clone(),
                    source,
                })?;
            debug!(path = %file.path, "Removed file");
        }
        Ok(())
    }
}
