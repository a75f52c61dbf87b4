//! Configuration sources.
//!
//! A [`ConfigSource`] delivers the latest desired OperatingSystemConfig as
//! raw bytes plus a checksum. The bytes are persisted verbatim as the
//! baseline once a pass succeeds.

use std::path::PathBuf;

use async_trait::async_trait;
use gardener_reconcile::Checksum;
use thiserror::Error;

use crate::node::ApiError;

/// Errors from fetching the desired configuration.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("unable to read configuration from {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("secret {secret} has no data key {key}")]
    MissingKey { secret: String, key: String },

    #[error("secret {secret} carries invalid base64 data: {source}")]
    Encoding {
        secret: String,
        #[source]
        source: base64::DecodeError,
    },
}

/// A versioned configuration blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigBlob {
    pub raw: Vec<u8>,
    pub checksum: Checksum,
}

impl ConfigBlob {
    /// Blob whose checksum is the SHA-256 of its bytes.
    pub fn new(raw: Vec<u8>) -> Self {
        let checksum = Checksum::of(&raw);
        Self { raw, checksum }
    }
}

/// Supplies the desired configuration.
#[async_trait]
pub trait ConfigSource: Send + Sync {
    /// Fetch the latest blob. `None` if no configuration exists yet.
    async fn fetch(&self) -> Result<Option<ConfigBlob>, SourceError>;
}

/// Reads the configuration from a local file.
#[derive(Debug, Clone)]
pub struct FileConfigSource {
    path: PathBuf,
}

impl FileConfigSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> Result<Option<ConfigBlob>, SourceError> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(Some(ConfigBlob::new(raw))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(SourceError::Read {
                path: self.path.clone(),
                source,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_source() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("osc.yaml");
        let source = FileConfigSource::new(&path);

        assert_eq!(source.fetch().await.unwrap(), None);

        std::fs::write(&path, b"spec: {}\n").unwrap();
        let blob = source.fetch().await.unwrap().unwrap();
        assert_eq!(blob.raw, b"spec: {}\n");
        assert_eq!(blob.checksum, Checksum::of(b"spec: {}\n"));
    }
}
