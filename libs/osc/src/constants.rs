//! Well-known unit names and node paths the diff engine reasons about.

/// The node agent's own unit. Never stopped, only restarted by exiting.
pub const NODE_AGENT_UNIT_NAME: &str = "gardener-node-agent.service";

/// Unit name of the container runtime.
pub const CONTAINERD_UNIT_NAME: &str = "containerd.service";

/// Unit name of the kubelet.
pub const KUBELET_UNIT_NAME: &str = "kubelet.service";

/// Kubelet configuration file; a content change is a kubelet config update.
pub const KUBELET_CONFIG_PATH: &str = "/var/lib/kubelet/config/kubelet";

/// Kubelet CA bundle; a content change signals a CA rotation.
pub const KUBELET_CA_PATH: &str = "/var/lib/kubelet/ca.crt";

/// Permissions applied to files that do not declare any.
pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o600;
