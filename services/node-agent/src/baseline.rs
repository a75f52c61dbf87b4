//! Persisted baseline: the last successfully applied configuration.

use std::path::PathBuf;
use std::sync::Arc;

use tracing::info;

use crate::fs::{write_if_changed, FileSystem, FsError};

/// Mode of the persisted baseline.
const BASELINE_PERMISSIONS: u32 = 0o644;

/// Reads and replaces the baseline file.
///
/// The raw blob is stored verbatim so a later decode sees exactly what was
/// applied.
#[derive(Clone)]
pub struct BaselineStore {
    fs: Arc<dyn FileSystem>,
    path: PathBuf,
    tmp_dir: PathBuf,
}

impl BaselineStore {
    pub fn new(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>, tmp_dir: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            path: path.into(),
            tmp_dir: tmp_dir.into(),
        }
    }

    /// The raw baseline, or `None` if nothing was applied yet.
    pub async fn load(&self) -> Result<Option<Vec<u8>>, FsError> {
        self.fs.read(&self.path).await
    }

    /// Replace the baseline atomically. Identical content is not rewritten.
    pub async fn persist(&self, raw: &[u8]) -> Result<(), FsError> {
        let written = write_if_changed(
            self.fs.as_ref(),
            &self.tmp_dir,
            &self.path,
            raw,
            BASELINE_PERMISSIONS,
        )
        .await?;

        info!(path = %self.path.display(), written, "Persisted applied configuration");
        Ok(())
    }
}
