//! containerd configuration and registry mirrors.
//!
//! The agent owns a handful of keys in `/etc/containerd/config.toml` and the
//! per-registry `hosts.toml` files below `/etc/containerd/certs.d`. Everything
//! else in the config file is left as found.

mod config;
mod registries;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::fs::{FileSystem, FsError};
use crate::paths::NodePaths;

pub use config::render_config;
pub use registries::{render_hosts_toml, RegistryProbes};

/// Errors from containerd reconciliation.
#[derive(Debug, Error)]
pub enum ContainerdError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("unable to parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("unable to render containerd config: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid value at {key}: {reason}")]
    InvalidConfig { key: String, reason: String },

    #[error("registries {upstreams:?} not ready within {timeout:?}")]
    RegistriesNotReady {
        upstreams: Vec<String>,
        timeout: Duration,
    },
}

/// Default interval between two readiness probes of a registry.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Applies the containerd parts of a change-set.
pub struct ContainerdReconciler {
    fs: Arc<dyn FileSystem>,
    paths: NodePaths,
    http: reqwest::Client,
    probe_interval: Duration,
}

impl ContainerdReconciler {
    pub fn new(fs: Arc<dyn FileSystem>, paths: NodePaths, http: reqwest::Client) -> Self {
        Self {
            fs,
            paths,
            http,
            probe_interval: DEFAULT_PROBE_INTERVAL,
        }
    }

    pub fn with_probe_interval(mut self, interval: Duration) -> Self {
        self.probe_interval = interval;
        self
    }
}
