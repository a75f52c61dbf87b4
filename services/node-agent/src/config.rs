//! Node agent configuration.
//!
//! Every flag can also be set through a `GNA_*` environment variable.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use gardener_reconcile::{DEFAULT_BACKOFF_BASE, DEFAULT_BACKOFF_MAX, DEFAULT_REQUEUE_DELAY};
use thiserror::Error;

use crate::controller::ControllerSettings;
use crate::kubelet::DEFAULT_HEALTH_ENDPOINT;
use crate::paths::{NodePaths, DEFAULT_BASE_DIR};
use crate::reconciler::ReconcilerConfig;

/// Kernel view of the hostname.
const KERNEL_HOSTNAME_PATH: &str = "/proc/sys/kernel/hostname";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("either --osc-file or --osc-secret must be set")]
    NoSource,

    #[error("--api-server must be set")]
    MissingApiServer,

    #[error("unable to determine the hostname; set --hostname")]
    Hostname,

    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

/// Where the desired configuration comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceSelection {
    File(PathBuf),
    /// Secret name in kube-system.
    Secret(String),
}

#[derive(Debug, Clone, Parser)]
#[command(name = "gardener-node-agent")]
#[command(author, version, about, long_about = None)]
pub struct NodeAgentConfig {
    /// Name of this node's Node object; looked up by hostname when unset.
    #[arg(long, env = "GNA_NODE_NAME")]
    pub node_name: Option<String>,

    /// Hostname of this machine. Defaults to the kernel hostname.
    #[arg(long, env = "GNA_HOSTNAME")]
    pub hostname: Option<String>,

    /// Kubernetes version of the worker pool, written as node label.
    #[arg(long, env = "GNA_KUBERNETES_VERSION")]
    pub kubernetes_version: Option<String>,

    /// Read the configuration from a local file.
    #[arg(long, env = "GNA_OSC_FILE", conflicts_with = "osc_secret")]
    pub osc_file: Option<PathBuf>,

    /// Read the configuration from this Secret in kube-system.
    #[arg(long, env = "GNA_OSC_SECRET")]
    pub osc_secret: Option<String>,

    #[arg(long, env = "GNA_API_SERVER")]
    pub api_server: Option<String>,

    /// Bearer token for the API server, re-read on every request.
    #[arg(
        long,
        env = "GNA_TOKEN_FILE",
        default_value = "/var/lib/gardener-node-agent/credentials/token"
    )]
    pub token_file: PathBuf,

    /// CA bundle of the API server.
    #[arg(long, env = "GNA_CA_FILE")]
    pub ca_file: Option<PathBuf>,

    #[arg(long, env = "GNA_API_TIMEOUT_SECS", default_value_t = 30)]
    pub api_timeout_secs: u64,

    /// Interval between two passes of a converged node.
    #[arg(long, env = "GNA_SYNC_PERIOD_SECS", default_value_t = 60)]
    pub sync_period_secs: u64,

    /// Interval between checks for a new configuration.
    #[arg(long, env = "GNA_POLL_INTERVAL_SECS", default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// State directory of the agent.
    #[arg(long, env = "GNA_BASE_DIR", default_value = DEFAULT_BASE_DIR)]
    pub base_dir: PathBuf,

    /// Filesystem root all node paths are resolved below.
    #[arg(long, env = "GNA_ROOT", default_value = "/")]
    pub root: PathBuf,

    /// Max unit commands running at once.
    #[arg(long, env = "GNA_UNIT_COMMAND_PARALLELISM", default_value_t = 10)]
    pub unit_command_parallelism: usize,

    #[arg(long, env = "GNA_KUBELET_HEALTH_ENDPOINT", default_value = DEFAULT_HEALTH_ENDPOINT)]
    pub kubelet_health_endpoint: String,

    #[arg(long, env = "GNA_KUBELET_HEALTH_INTERVAL_SECS", default_value_t = 5)]
    pub kubelet_health_interval_secs: u64,

    #[arg(long, env = "GNA_KUBELET_HEALTH_TIMEOUT_SECS", default_value_t = 300)]
    pub kubelet_health_timeout_secs: u64,

    /// How long to wait for changed registry mirrors to answer.
    #[arg(long, env = "GNA_REGISTRY_WAIT_TIMEOUT_SECS", default_value_t = 300)]
    pub registry_wait_timeout_secs: u64,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, env = "GNA_LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl NodeAgentConfig {
    /// Reject combinations clap cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.source()?;
        if self.api_server.is_none() {
            return Err(ConfigError::MissingApiServer);
        }
        if self.unit_command_parallelism == 0 {
            return Err(ConfigError::Zero("--unit-command-parallelism"));
        }
        if self.sync_period_secs == 0 {
            return Err(ConfigError::Zero("--sync-period-secs"));
        }
        if self.poll_interval_secs == 0 {
            return Err(ConfigError::Zero("--poll-interval-secs"));
        }
        Ok(())
    }

    pub fn source(&self) -> Result<SourceSelection, ConfigError> {
        match (&self.osc_file, &self.osc_secret) {
            (Some(path), _) => Ok(SourceSelection::File(path.clone())),
            (None, Some(name)) => Ok(SourceSelection::Secret(name.clone())),
            (None, None) => Err(ConfigError::NoSource),
        }
    }

    /// The configured hostname, else the kernel's, else `$HOSTNAME`.
    pub fn resolved_hostname(&self) -> Result<String, ConfigError> {
        let candidates = [
            self.hostname.clone(),
            std::fs::read_to_string(KERNEL_HOSTNAME_PATH).ok(),
            std::env::var("HOSTNAME").ok(),
        ];

        candidates
            .into_iter()
            .flatten()
            .map(|name| name.trim().to_lowercase())
            .find(|name| !name.is_empty())
            .ok_or(ConfigError::Hostname)
    }

    pub fn paths(&self) -> NodePaths {
        NodePaths::new(&self.base_dir)
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }

    pub fn controller_settings(&self) -> Result<ControllerSettings, ConfigError> {
        Ok(ControllerSettings {
            node_name: self.node_name.clone(),
            hostname: self.resolved_hostname()?,
            kubernetes_version: self.kubernetes_version.clone(),
            unit_command_parallelism: self.unit_command_parallelism,
            kubelet_health_interval: Duration::from_secs(self.kubelet_health_interval_secs),
            kubelet_health_timeout: Duration::from_secs(self.kubelet_health_timeout_secs),
            registry_wait_timeout: Duration::from_secs(self.registry_wait_timeout_secs),
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        })
    }

    pub fn reconciler_config(&self) -> ReconcilerConfig {
        ReconcilerConfig {
            sync_period: Duration::from_secs(self.sync_period_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            backoff_base: DEFAULT_BACKOFF_BASE,
            backoff_max: DEFAULT_BACKOFF_MAX,
        }
    }
}
