//! Well-known locations on the node.

use std::path::{Path, PathBuf};

/// Default state directory of the agent.
pub const DEFAULT_BASE_DIR: &str = "/var/lib/gardener-node-agent";

/// Locations the agent reads and writes.
///
/// Everything lives at its usual place except the agent's own state, which
/// follows the configured base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePaths {
    /// Last successfully applied configuration.
    pub baseline: PathBuf,

    /// Parent of the per-pass temporary directories.
    pub tmp_dir: PathBuf,

    /// Bootstrap token, removed once the node is registered.
    pub bootstrap_token: PathBuf,

    /// Cache for OCI blobs.
    pub image_cache: PathBuf,

    pub systemd_unit_dir: PathBuf,

    pub os_release: PathBuf,

    pub kubelet_dir: PathBuf,

    pub containerd_config: PathBuf,

    pub containerd_imports_dir: PathBuf,

    pub containerd_certs_dir: PathBuf,
}

impl NodePaths {
    /// Standard layout with the agent's state below `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        let base = base_dir.as_ref();
        Self {
            baseline: base.join("last-applied-osc.yaml"),
            tmp_dir: base.join("tmp"),
            bootstrap_token: base.join("credentials").join("bootstrap-token"),
            image_cache: base.join("cache").join("blobs"),
            systemd_unit_dir: PathBuf::from("/etc/systemd/system"),
            os_release: PathBuf::from("/etc/os-release"),
            kubelet_dir: PathBuf::from("/var/lib/kubelet"),
            containerd_config: PathBuf::from("/etc/containerd/config.toml"),
            containerd_imports_dir: PathBuf::from("/etc/containerd/conf.d"),
            containerd_certs_dir: PathBuf::from("/etc/containerd/certs.d"),
        }
    }

    pub fn unit_file(&self, unit: &str) -> PathBuf {
        self.systemd_unit_dir.join(unit)
    }

    pub fn drop_in_dir(&self, unit: &str) -> PathBuf {
        self.systemd_unit_dir.join(format!("{unit}.d"))
    }

    pub fn kubeconfig_bootstrap(&self) -> PathBuf {
        self.kubelet_dir.join("kubeconfig-bootstrap")
    }

    pub fn kubeconfig_real(&self) -> PathBuf {
        self.kubelet_dir.join("kubeconfig-real")
    }

    pub fn kubelet_pki_dir(&self) -> PathBuf {
        self.kubelet_dir.join("pki")
    }

    pub fn kubelet_client_certificate(&self) -> PathBuf {
        self.kubelet_pki_dir().join("kubelet-client-current.pem")
    }

    pub fn kubelet_temp_client_certificate(&self) -> PathBuf {
        self.kubelet_pki_dir()
            .join("temp")
            .join("kubelet-client-current.pem")
    }

    pub fn registry_hosts_dir(&self, upstream: &str) -> PathBuf {
        self.containerd_certs_dir.join(upstream)
    }
}

impl Default for NodePaths {
    fn default() -> Self {
        Self::new(DEFAULT_BASE_DIR)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_layout() {
        let paths = NodePaths::default();
        assert_eq!(
            paths.baseline,
            PathBuf::from("/var/lib/gardener-node-agent/last-applied-osc.yaml")
        );
        assert_eq!(
            paths.bootstrap_token,
            PathBuf::from("/var/lib/gardener-node-agent/credentials/bootstrap-token")
        );
        assert_eq!(
            paths.drop_in_dir("kubelet.service"),
            PathBuf::from("/etc/systemd/system/kubelet.service.d")
        );
        assert_eq!(
            paths.kubelet_temp_client_certificate(),
            PathBuf::from("/var/lib/kubelet/pki/temp/kubelet-client-current.pem")
        );
    }
}
