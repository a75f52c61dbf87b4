//! Errors of a reconciliation pass.

use gardener_osc::OscError;
use thiserror::Error;

use crate::applier::ApplyError;
use crate::containerd::ContainerdError;
use crate::fs::FsError;
use crate::kubelet::KubeletError;
use crate::node::ApiError;
use crate::osupdate::OsUpdateError;
use crate::source::SourceError;
use crate::stages::Stage;
use crate::systemd::SystemdError;

/// Why a stage failed.
#[derive(Debug, Error)]
pub enum StageError {
    #[error(transparent)]
    Source(#[from] SourceError),

    #[error(transparent)]
    Config(#[from] OscError),

    #[error(transparent)]
    Fs(#[from] FsError),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error(transparent)]
    Containerd(#[from] ContainerdError),

    #[error(transparent)]
    Kubelet(#[from] KubeletError),

    #[error(transparent)]
    OsUpdate(#[from] OsUpdateError),

    #[error(transparent)]
    Systemd(#[from] SystemdError),

    #[error("OS update to {version} requested but no update script is configured")]
    MissingUpdateScript { version: String },
}

/// A pass aborted in `stage`.
#[derive(Debug, Error)]
#[error("stage {stage} failed: {source}")]
pub struct PassError {
    pub stage: Stage,
    #[source]
    pub source: StageError,
}

impl PassError {
    pub fn new(stage: Stage, source: impl Into<StageError>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::path::PathBuf;

    #[test]
    fn test_pass_error_names_stage_and_path() {
        let fs = FsError::new(
            "write",
            PathBuf::from("/etc/a"),
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        let err = PassError::new(Stage::PersistBaseline, fs);

        let message = err.to_string();
        assert!(message.starts_with("stage persist-baseline failed"));
        assert!(message.contains("/etc/a"));
        assert!(matches!(err.source, StageError::Fs(_)));
    }
}
