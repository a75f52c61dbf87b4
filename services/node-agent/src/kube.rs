//! Kubernetes API server client.
//!
//! A thin REST client that covers exactly what the agent needs: the
//! [`NodeApi`] calls and reading the Secret that carries the configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gardener_reconcile::Checksum;
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, error, info};

use crate::node::{ApiError, Node, NodeApi, NodePatch, PodRef, LABEL_HOSTNAME};
use crate::source::{ConfigBlob, ConfigSource, SourceError};

/// Namespace holding the configuration Secret.
pub const CONFIG_SECRET_NAMESPACE: &str = "kube-system";

/// Data key of the configuration inside the Secret.
pub const CONFIG_SECRET_DATA_KEY: &str = "osc.yaml";

/// Annotation on the Secret carrying the configuration checksum.
pub const ANNOTATION_CHECKSUM_DATA_SCRIPT: &str = "checksum/data-script";

/// Connection settings for the API server.
#[derive(Debug, Clone)]
pub struct KubeClientConfig {
    pub server: String,

    /// Bearer token file; re-read on every request since tokens rotate.
    pub token_file: Option<PathBuf>,

    /// PEM bundle to verify the server certificate with.
    pub ca_file: Option<PathBuf>,

    pub timeout: Duration,
}

/// REST client for the Kubernetes API server.
pub struct KubeClient {
    client: reqwest::Client,
    config: KubeClientConfig,
}

impl KubeClient {
    /// Create a new API client.
    pub fn new(config: KubeClientConfig) -> Result<Self, ApiError> {
        let mut builder = reqwest::Client::builder().timeout(config.timeout);

        if let Some(ca_file) = &config.ca_file {
            let pem = std::fs::read(ca_file).map_err(|source| ApiError::Credentials {
                path: ca_file.clone(),
                source,
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| ApiError::Invalid(format!("CA bundle {ca_file:?}: {e}")))?;
            builder = builder.add_root_certificate(certificate);
        }

        let client = builder
            .build()
            .map_err(|e| ApiError::Invalid(format!("unable to build HTTP client: {e}")))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.server.trim_end_matches('/'), path)
    }

    async fn request(&self, method: Method, path: &str) -> Result<RequestBuilder, ApiError> {
        let mut request = self.client.request(method, self.url(path));

        if let Some(token_file) = &self.config.token_file {
            let token = tokio::fs::read_to_string(token_file)
                .await
                .map_err(|source| ApiError::Credentials {
                    path: token_file.clone(),
                    source,
                })?;
            request = request.bearer_auth(token.trim());
        }

        Ok(request)
    }

    /// Send a request; 404 maps to `None`, other non-success statuses to errors.
    async fn send(
        &self,
        method: Method,
        path: &str,
        build: impl FnOnce(RequestBuilder) -> RequestBuilder,
    ) -> Result<Option<Response>, ApiError> {
        let url = self.url(path);
        let request = build(self.request(method.clone(), path).await?);

        debug!(method = %method, url = %url, "Calling API server");
        let response = request.send().await.map_err(|source| ApiError::Request {
            method: method.to_string(),
            url: url.clone(),
            source,
        })?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => Ok(Some(response)),
            status => {
                let body = response.text().await.unwrap_or_default();
                error!(method = %method, url = %url, status = %status, body = %body, "API request failed");
                Err(ApiError::Status {
                    method: method.to_string(),
                    url,
                    status: status.as_u16(),
                    body,
                })
            }
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, ApiError> {
        self.list(path, &[]).await
    }

    /// GET with query parameters, encoded by the request builder.
    async fn list<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<Option<T>, ApiError> {
        let Some(response) = self.send(Method::GET, path, |r| r.query(query)).await? else {
            return Ok(None);
        };
        let value = response
            .json()
            .await
            .map_err(|e| ApiError::Invalid(format!("GET {path}: {e}")))?;
        Ok(Some(value))
    }

    /// Read a Secret's data key and checksum annotation.
    pub async fn get_secret_data(
        &self,
        namespace: &str,
        name: &str,
        key: &str,
    ) -> Result<Option<(Vec<u8>, Option<String>)>, SourceError> {
        let path = format!("/api/v1/namespaces/{namespace}/secrets/{name}");
        let Some(secret) = self.get::<SecretObject>(&path).await? else {
            return Ok(None);
        };

        let encoded = secret.data.get(key).ok_or_else(|| SourceError::MissingKey {
            secret: format!("{namespace}/{name}"),
            key: key.to_string(),
        })?;
        let data = STANDARD
            .decode(encoded)
            .map_err(|source| SourceError::Encoding {
                secret: format!("{namespace}/{name}"),
                source,
            })?;

        let checksum = secret
            .metadata
            .annotations
            .get(ANNOTATION_CHECKSUM_DATA_SCRIPT)
            .cloned();
        Ok(Some((data, checksum)))
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    #[serde(default)]
    name: String,
    #[serde(default)]
    namespace: String,
    #[serde(default)]
    labels: BTreeMap<String, String>,
    #[serde(default)]
    annotations: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct NodeObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct PodObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
struct SecretObject {
    #[serde(default)]
    metadata: ObjectMeta,
    #[serde(default)]
    data: BTreeMap<String, String>,
}

#[derive(Debug, Deserialize)]
struct ObjectList<T> {
    #[serde(default = "Vec::new")]
    items: Vec<T>,
}

impl From<NodeObject> for Node {
    fn from(object: NodeObject) -> Self {
        Self {
            name: object.metadata.name,
            labels: object.metadata.labels,
            annotations: object.metadata.annotations,
        }
    }
}

#[async_trait]
impl NodeApi for KubeClient {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ApiError> {
        let node = self
            .get::<NodeObject>(&format!("/api/v1/nodes/{name}"))
            .await?;
        Ok(node.map(Node::from))
    }

    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, ApiError> {
        let selector = format!("{LABEL_HOSTNAME}={hostname}");
        let list = self
            .list::<ObjectList<NodeObject>>("/api/v1/nodes", &[("labelSelector", selector)])
            .await?
            .map(|l| l.items)
            .unwrap_or_default();

        match list.len() {
            0 => Ok(None),
            1 => Ok(list.into_iter().next().map(Node::from)),
            n => Err(ApiError::Invalid(format!(
                "found {n} nodes with label {LABEL_HOSTNAME}={hostname}"
            ))),
        }
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError> {
        let path = format!("/api/v1/nodes/{name}");
        let body = patch.to_merge_patch();
        let response = self
            .send(Method::PATCH, &path, |r| {
                r.header("Content-Type", "application/merge-patch+json")
                    .body(body.to_string())
            })
            .await?;

        if response.is_none() {
            return Err(ApiError::Status {
                method: "PATCH".to_string(),
                url: self.url(&path),
                status: StatusCode::NOT_FOUND.as_u16(),
                body: format!("node {name} not found"),
            });
        }

        debug!(node = %name, "Patched node");
        Ok(())
    }

    async fn list_pods_on_node(&self, name: &str) -> Result<Vec<PodRef>, ApiError> {
        let selector = format!("spec.nodeName={name}");
        let pods = self
            .list::<ObjectList<PodObject>>("/api/v1/pods", &[("fieldSelector", selector)])
            .await?
            .map(|l| l.items)
            .unwrap_or_default();

        Ok(pods
            .into_iter()
            .map(|p| PodRef::new(p.metadata.namespace, p.metadata.name))
            .collect())
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ApiError> {
        let path = format!("/api/v1/namespaces/{}/pods/{}", pod.namespace, pod.name);
        if self.send(Method::DELETE, &path, |r| r).await?.is_some() {
            info!(namespace = %pod.namespace, pod = %pod.name, "Deleted pod");
        }
        Ok(())
    }
}

/// Reads the configuration from a Secret in `kube-system`.
pub struct SecretConfigSource {
    client: Arc<KubeClient>,
    name: String,
}

impl SecretConfigSource {
    pub fn new(client: Arc<KubeClient>, name: impl Into<String>) -> Self {
        Self {
            client,
            name: name.into(),
        }
    }
}

#[async_trait]
impl ConfigSource for SecretConfigSource {
    async fn fetch(&self) -> Result<Option<ConfigBlob>, SourceError> {
        let Some((raw, checksum)) = self
            .client
            .get_secret_data(CONFIG_SECRET_NAMESPACE, &self.name, CONFIG_SECRET_DATA_KEY)
            .await?
        else {
            return Ok(None);
        };

        let checksum = checksum
            .map(Checksum::from)
            .unwrap_or_else(|| Checksum::of(&raw));
        Ok(Some(ConfigBlob { raw, checksum }))
    }
}
