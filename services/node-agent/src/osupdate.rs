//! In-place operating system updates.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::info;

#[derive(Debug, Error)]
pub enum OsUpdateError {
    #[error("unable to run update script {script:?}: {source}")]
    Spawn {
        script: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("update script {script:?} for version {version} failed ({status}): {output}")]
    Failed {
        script: PathBuf,
        version: String,
        status: String,
        output: String,
    },
}

/// Runs the update script shipped with the configuration.
#[async_trait]
pub trait OsUpdateExecutor: Send + Sync {
    /// Update the OS to `version`; returns once the script finished.
    async fn run(&self, script: &Path, version: &str) -> Result<(), OsUpdateError>;
}

/// Runs the script as `<shell> <script> <version>`.
#[derive(Debug, Clone)]
pub struct BashUpdateExecutor {
    shell: PathBuf,
}

impl BashUpdateExecutor {
    pub fn new() -> Self {
        Self::with_shell("/bin/bash")
    }

    pub fn with_shell(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for BashUpdateExecutor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OsUpdateExecutor for BashUpdateExecutor {
    async fn run(&self, script: &Path, version: &str) -> Result<(), OsUpdateError> {
        info!(script = %script.display(), version = %version, "Running OS update script");

        let output = Command::new(&self.shell)
            .arg(script)
            .arg(version)
            .output()
            .await
            .map_err(|source| OsUpdateError::Spawn {
                script: script.to_path_buf(),
                source,
            })?;

        if !output.status.success() {
            let mut combined = String::from_utf8_lossy(&output.stdout).trim().to_string();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(stderr.trim());
            }
            return Err(OsUpdateError::Failed {
                script: script.to_path_buf(),
                version: version.to_string(),
                status: output.status.to_string(),
                output: combined,
            });
        }

        info!(script = %script.display(), version = %version, "OS update script finished");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    #[tokio::test]
    async fn test_script_receives_version() {
        let dir = TempDir::new().unwrap();
        let marker = dir.path().join("version");
        let script = dir.path().join("update.sh");
        std::fs::write(&script, format!("echo -n \"$1\" > {}\n", marker.display())).unwrap();

        BashUpdateExecutor::new().run(&script, "1443.3").await.unwrap();

        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "1443.3");
    }

    #[tokio::test]
    async fn test_script_failure_is_reported() {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("update.sh");
        std::fs::write(&script, "echo 'disk full' >&2\nexit 3\n").unwrap();

        let err = BashUpdateExecutor::new().run(&script, "2.0").await.unwrap_err();

        match err {
            OsUpdateError::Failed { version, output, .. } => {
                assert_eq!(version, "2.0");
                assert_eq!(output, "disk full");
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
