//! Executes a change-set against the node.
//!
//! The applier owns the file and unit side effects of a pass. Ordering
//! between the individual steps is decided by the controller.

mod files;
mod units;

use std::fmt::Write as _;
use std::sync::Arc;

use thiserror::Error;

use crate::fs::{FileSystem, FsError};
use crate::image::{ImageError, ImageExtractor};
use crate::paths::NodePaths;
use crate::systemd::{SystemdControl, SystemdError};

pub use units::{plan_unit_commands, UnitAction, UnitCommandPlan};

/// Errors from applying a change-set.
#[derive(Debug, Error)]
pub enum ApplyError {
    #[error("unable to decode content of file {path}: {source}")]
    Decode {
        path: String,
        #[source]
        source: gardener_osc::DecodeError,
    },

    #[error("file {path} has no usable content")]
    MissingContent { path: String },

    #[error("unable to write file {path}: {source}")]
    WriteFile {
        path: String,
        #[source]
        source: FsError,
    },

    #[error("unable to remove file {path}: {source}")]
    RemoveFile {
        path: String,
        #[source]
        source: FsError,
    },

    #[error(transparent)]
    Image(#[from] ImageError),

    #[error("unable to manage files of unit {unit}: {source}")]
    UnitFiles {
        unit: String,
        #[source]
        source: FsError,
    },

    #[error(transparent)]
    Systemd(#[from] SystemdError),

    #[error("{}", describe_command_failures(.0))]
    UnitCommands(Vec<SystemdError>),
}

fn describe_command_failures(errors: &[SystemdError]) -> String {
    let mut message = format!("{} unit command(s) failed", errors.len());
    for error in errors {
        let _ = write!(message, "; {error}");
    }
    message
}

/// File and unit side effects of a pass.
pub struct Applier {
    fs: Arc<dyn FileSystem>,
    systemd: Arc<dyn SystemdControl>,
    images: Arc<dyn ImageExtractor>,
    paths: NodePaths,
}

impl Applier {
    pub fn new(
        fs: Arc<dyn FileSystem>,
        systemd: Arc<dyn SystemdControl>,
        images: Arc<dyn ImageExtractor>,
        paths: NodePaths,
    ) -> Self {
        Self {
            fs,
            systemd,
            images,
            paths,
        }
    }
}
