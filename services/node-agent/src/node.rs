//! Node API capability.
//!
//! The agent only needs a small slice of the Kubernetes API: reading its own
//! Node object, merge-patching labels and annotations, and deleting the pods
//! scheduled onto the node during an in-place update.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Annotation carrying the checksum of the last applied configuration.
pub const ANNOTATION_CHECKSUM_APPLIED: &str = "checksum/cloud-config-data";

/// Annotation carrying the OS version an in-place update is moving to.
pub const ANNOTATION_UPDATING_OS_VERSION: &str = "worker.gardener.cloud/updating-os-version";

/// Label carrying the Kubernetes version of the worker.
pub const LABEL_KUBERNETES_VERSION: &str = "worker.gardener.cloud/kubernetes-version";

/// Label set by the machine controller once the node is drained for an update.
pub const LABEL_MACHINE_READY_FOR_UPDATE: &str = "node.machine.sapcloud.io/machine-ready-for-update";

/// Label set by the agent once the OS update went through.
pub const LABEL_MACHINE_UPDATE_SUCCESSFUL: &str =
    "node.machine.sapcloud.io/machine-update-successful";

/// Well-known hostname label used to find the node without a configured name.
pub const LABEL_HOSTNAME: &str = "kubernetes.io/hostname";

/// Errors from the node API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("request {method} {url} failed: {source}")]
    Request {
        method: String,
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{method} {url} returned {status}: {body}")]
    Status {
        method: String,
        url: String,
        status: u16,
        body: String,
    },

    #[error("unable to read credentials from {path:?}: {source}")]
    Credentials {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid API response: {0}")]
    Invalid(String),
}

/// The parts of a Node object the agent reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn label(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(String::as_str)
    }
}

/// A JSON merge patch of node metadata. `None` values delete the key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct NodePatch {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, Option<String>>,

    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, Option<String>>,
}

impl NodePatch {
    pub fn label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), Some(value.into()));
        self
    }

    pub fn annotation(mut self, key: &str, value: impl Into<String>) -> Self {
        self.annotations.insert(key.to_string(), Some(value.into()));
        self
    }

    /// Apply the patch to a node, as the API server would.
    pub fn apply_to(&self, node: &mut Node) {
        merge(&mut node.labels, &self.labels);
        merge(&mut node.annotations, &self.annotations);
    }

    /// Merge patch body for the API server.
    pub fn to_merge_patch(&self) -> serde_json::Value {
        serde_json::json!({ "metadata": self })
    }
}

fn merge(target: &mut BTreeMap<String, String>, patch: &BTreeMap<String, Option<String>>) {
    for (key, value) in patch {
        match value {
            Some(value) => {
                target.insert(key.clone(), value.clone());
            }
            None => {
                target.remove(key);
            }
        }
    }
}

/// Namespaced pod name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize, Serialize)]
pub struct PodRef {
    pub namespace: String,
    pub name: String,
}

impl PodRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// Access to the Node object and the pods bound to it.
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// Get a node by name. `None` if it is not registered (yet).
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ApiError>;

    /// Find the node carrying the given hostname label.
    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, ApiError>;

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError>;

    async fn list_pods_on_node(&self, name: &str) -> Result<Vec<PodRef>, ApiError>;

    /// Delete a pod. Deleting an already deleted pod succeeds.
    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ApiError>;
}
