//! systemd capability.
//!
//! [`SystemdControl`] abstracts unit lifecycle operations. All operations are
//! idempotent: disabling an unknown unit or stopping a stopped one succeeds.

use std::fmt;
use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// A unit lifecycle operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UnitOperation {
    Enable,
    Disable,
    Start,
    Stop,
    Restart,
    DaemonReload,
}

impl UnitOperation {
    /// The `systemctl` verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Enable => "enable",
            Self::Disable => "disable",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
            Self::DaemonReload => "daemon-reload",
        }
    }
}

impl fmt::Display for UnitOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors from unit operations.
#[derive(Debug, Error)]
pub enum SystemdError {
    #[error("unable to run systemctl {op} {unit}: {source}")]
    Spawn {
        op: UnitOperation,
        unit: String,
        #[source]
        source: io::Error,
    },

    #[error("systemctl {op} {unit} failed ({status}): {stderr}")]
    Failed {
        op: UnitOperation,
        unit: String,
        status: String,
        stderr: String,
    },
}

impl SystemdError {
    /// The unit the failed operation targeted; empty for daemon-reload.
    pub fn unit(&self) -> &str {
        match self {
            Self::Spawn { unit, .. } | Self::Failed { unit, .. } => unit,
        }
    }
}

/// Unit lifecycle operations.
#[async_trait]
pub trait SystemdControl: Send + Sync {
    async fn enable(&self, unit: &str) -> Result<(), SystemdError>;

    async fn disable(&self, unit: &str) -> Result<(), SystemdError>;

    async fn start(&self, unit: &str) -> Result<(), SystemdError>;

    async fn stop(&self, unit: &str) -> Result<(), SystemdError>;

    async fn restart(&self, unit: &str) -> Result<(), SystemdError>;

    async fn daemon_reload(&self) -> Result<(), SystemdError>;

    /// Dispatch an operation by value.
    async fn run(&self, op: UnitOperation, unit: &str) -> Result<(), SystemdError> {
        match op {
            UnitOperation::Enable => self.enable(unit).await,
            UnitOperation::Disable => self.disable(unit).await,
            UnitOperation::Start => self.start(unit).await,
            UnitOperation::Stop => self.stop(unit).await,
            UnitOperation::Restart => self.restart(unit).await,
            UnitOperation::DaemonReload => self.daemon_reload().await,
        }
    }
}

/// [`SystemdControl`] backed by the `systemctl` binary.
#[derive(Debug, Clone)]
pub struct SystemctlClient {
    binary: PathBuf,
}

impl SystemctlClient {
    pub fn new() -> Self {
        Self::with_binary("systemctl")
    }

    pub fn with_binary(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn systemctl(&self, op: UnitOperation, unit: &str) -> Result<(), SystemdError> {
        let mut command = Command::new(&self.binary);
        command.arg(op.as_str());
        if op != UnitOperation::DaemonReload {
            command.arg(unit);
        }

        debug!(op = %op, unit = %unit, "Running systemctl");
        let output = command.output().await.map_err(|source| SystemdError::Spawn {
            op,
            unit: unit.to_string(),
            source,
        })?;

        if output.status.success() {
            info!(op = %op, unit = %unit, "Unit operation succeeded");
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_already_converged(op, &stderr) {
            debug!(op = %op, unit = %unit, stderr = %stderr, "Unit already in requested state");
            return Ok(());
        }

        Err(SystemdError::Failed {
            op,
            unit: unit.to_string(),
            status: output.status.to_string(),
            stderr,
        })
    }
}

impl Default for SystemctlClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Failures that mean the unit is already where the operation would put it.
fn is_already_converged(op: UnitOperation, stderr: &str) -> bool {
    let unknown_unit = stderr.contains("does not exist") || stderr.contains("not loaded");
    matches!(op, UnitOperation::Disable | UnitOperation::Stop) && unknown_unit
}

#[async_trait]
impl SystemdControl for SystemctlClient {
    async fn enable(&self, unit: &str) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::Enable, unit).await
    }

    async fn disable(&self, unit: &str) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::Disable, unit).await
    }

    async fn start(&self, unit: &str) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::Start, unit).await
    }

    async fn stop(&self, unit: &str) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::Stop, unit).await
    }

    async fn restart(&self, unit: &str) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::Restart, unit).await
    }

    async fn daemon_reload(&self) -> Result<(), SystemdError> {
        self.systemctl(UnitOperation::DaemonReload, "").await
    }
}
