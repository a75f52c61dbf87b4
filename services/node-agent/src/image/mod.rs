//! Copying single files out of container images.
//!
//! This module handles:
//! - Parsing image references
//! - Pulling OCI manifests (resolving indexes to the node's platform)
//! - Caching layer blobs by digest
//! - Finding a file in the layer stack, newest layer first, honoring whiteouts

mod extractor;
mod layer;
mod oci;
mod reference;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;

use crate::fs::FsError;

pub use extractor::OciImageExtractor;
pub use layer::{lookup_in_layer, lookup_in_layer_file, LayerLookup};
pub use oci::{Descriptor, Manifest, OciClient, OciConfig, OciError, Platform};
pub use reference::ImageReference;

/// Why a file could not be copied out of an image.
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("invalid image reference {0:?}")]
    InvalidReference(String),

    #[error(transparent)]
    Registry(#[from] OciError),

    #[error("file not found in image")]
    FileNotFound,

    #[error("unable to read layer: {0}")]
    Layer(#[from] std::io::Error),

    #[error("layer scan aborted: {0}")]
    Join(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Write(#[from] FsError),
}

/// A failed copy, with the image, in-image path and destination.
#[derive(Debug, Error)]
#[error("unable to copy {path_in_image:?} from image {image} to {dest:?}: {source}")]
pub struct ImageError {
    pub image: String,
    pub path_in_image: String,
    pub dest: PathBuf,
    #[source]
    pub source: ExtractError,
}

impl ImageError {
    pub fn new(image: &str, path_in_image: &str, dest: &Path, source: impl Into<ExtractError>) -> Self {
        Self {
            image: image.to_string(),
            path_in_image: path_in_image.to_string(),
            dest: dest.to_path_buf(),
            source: source.into(),
        }
    }
}

/// Copies a file from a container image onto the node.
#[async_trait]
pub trait ImageExtractor: Send + Sync {
    /// Copy `path_in_image` of `image` to `dest` with the given mode.
    async fn copy_from_image(
        &self,
        image: &str,
        path_in_image: &str,
        dest: &Path,
        mode: u32,
    ) -> Result<(), ImageError>;
}
