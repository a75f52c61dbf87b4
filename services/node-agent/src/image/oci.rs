//! OCI registry client for pulling manifests and blobs.
//!
//! This module implements the pull side of the OCI Distribution
//! Specification, including the anonymous bearer-token handshake that public
//! registries require and platform selection from image indexes.
//!
//! Reference: https://github.com/opencontainers/distribution-spec

use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::header::{ACCEPT, WWW_AUTHENTICATE};
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::reference::ImageReference;

const MANIFEST_ACCEPT: &str = "application/vnd.oci.image.index.v1+json, \
    application/vnd.docker.distribution.manifest.list.v2+json, \
    application/vnd.oci.image.manifest.v1+json, \
    application/vnd.docker.distribution.manifest.v2+json";

/// Errors from OCI operations.
#[derive(Debug, Error)]
pub enum OciError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Authentication required: {0}")]
    AuthRequired(String),

    #[error("Unexpected status {status} for {url}")]
    Status { status: u16, url: String },

    #[error("Image too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("No manifest for platform {0}")]
    NoMatchingPlatform(String),

    #[error("Pull timeout")]
    Timeout,
}

/// Configuration for the OCI client.
#[derive(Debug, Clone)]
pub struct OciConfig {
    /// Per-layer pull timeout.
    pub layer_timeout: Duration,
    /// Timeout for manifest and token requests.
    pub request_timeout: Duration,
    /// Max compressed image size.
    pub max_compressed_size: u64,
    /// Directory to store blobs.
    pub blob_dir: PathBuf,
    /// Registry hosts (without port) that are reached over plain HTTP.
    pub plain_http_hosts: Vec<String>,
    /// Platform to select from image indexes, e.g. `linux/amd64`.
    pub platform: Platform,
}

impl Default for OciConfig {
    fn default() -> Self {
        Self {
            layer_timeout: Duration::from_secs(300),
            request_timeout: Duration::from_secs(30),
            max_compressed_size: 2 * 1024 * 1024 * 1024,
            blob_dir: PathBuf::from("/var/lib/gardener-node-agent/cache/blobs"),
            plain_http_hosts: vec!["localhost".to_string(), "127.0.0.1".to_string()],
            platform: Platform::current(),
        }
    }
}

/// Operating system and architecture of an image.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Platform {
    pub os: String,
    pub architecture: String,
}

impl Platform {
    /// The platform this agent runs on.
    pub fn current() -> Self {
        let architecture = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        };
        Self {
            os: "linux".to_string(),
            architecture: architecture.to_string(),
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.os, self.architecture)
    }
}

/// OCI image manifest.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    /// Schema version.
    pub schema_version: u32,
    /// Media type.
    #[serde(default)]
    pub media_type: Option<String>,
    /// Config descriptor.
    pub config: Descriptor,
    /// Layer descriptors, base layer first.
    pub layers: Vec<Descriptor>,
}

impl Manifest {
    /// Get total compressed size of all layers.
    pub fn total_layer_size(&self) -> u64 {
        self.layers.iter().map(|l| l.size).sum()
    }
}

/// Content descriptor.
#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Descriptor {
    /// Media type of the referenced content.
    pub media_type: String,
    /// Digest of the content.
    pub digest: String,
    /// Size in bytes.
    pub size: u64,
}

/// Either an image index or a single-platform manifest.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ManifestDocument {
    #[serde(default)]
    manifests: Option<Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    digest: String,
    #[serde(default)]
    platform: Option<Platform>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    access_token: Option<String>,
}

/// OCI Distribution client.
pub struct OciClient {
    config: OciConfig,
    client: Client,
    /// Bearer tokens per registry and repository.
    tokens: Mutex<HashMap<String, String>>,
}

impl OciClient {
    /// Create a new OCI client.
    pub fn new(config: OciConfig) -> Result<Self, OciError> {
        let client = Client::builder().build()?;

        Ok(Self {
            config,
            client,
            tokens: Mutex::new(HashMap::new()),
        })
    }

    fn registry_url(&self, registry: &str) -> String {
        let host = registry.split(':').next().unwrap_or(registry);
        let scheme = if self.config.plain_http_hosts.iter().any(|h| h == host) {
            "http"
        } else {
            "https"
        };
        format!("{scheme}://{registry}")
    }

    /// Resolve an image reference to the manifest for the configured platform.
    pub async fn resolve_manifest(&self, image: &ImageReference) -> Result<Manifest, OciError> {
        let body = self.fetch_manifest(image, &image.reference).await?;

        let document: ManifestDocument = serde_json::from_slice(&body)?;
        let Some(entries) = document.manifests else {
            return Ok(serde_json::from_slice(&body)?);
        };

        let platform = &self.config.platform;
        let entry = entries
            .iter()
            .find(|e| e.platform.as_ref() == Some(platform))
            .ok_or_else(|| OciError::NoMatchingPlatform(platform.to_string()))?;

        debug!(image = %image, digest = %entry.digest, platform = %platform, "Selected manifest from index");
        let body = self.fetch_manifest(image, &entry.digest).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Pull a manifest by tag or digest; digests are verified.
    async fn fetch_manifest(&self, image: &ImageReference, reference: &str) -> Result<Vec<u8>, OciError> {
        let url = format!(
            "{}/v2/{}/manifests/{}",
            self.registry_url(&image.registry),
            image.repository,
            reference
        );

        debug!(url = %url, "Pulling manifest");
        let response = self.get(image, &url, Some(MANIFEST_ACCEPT)).await?;
        let body = response.bytes().await?.to_vec();

        if reference.starts_with("sha256:") {
            verify_digest(reference, &body)?;
        }
        Ok(body)
    }

    /// Make sure a blob is in the local cache and return its path.
    pub async fn ensure_blob(&self, image: &ImageReference, layer: &Descriptor) -> Result<PathBuf, OciError> {
        if layer.size > self.config.max_compressed_size {
            return Err(OciError::TooLarge {
                size: layer.size,
                limit: self.config.max_compressed_size,
            });
        }

        let dest = self.blob_path(&layer.digest);
        if tokio::fs::try_exists(&dest).await? {
            debug!(digest = %layer.digest, "Layer already cached");
            return Ok(dest);
        }

        self.pull_blob(image, &layer.digest, &dest).await?;
        Ok(dest)
    }

    /// Pull a blob by digest to a file.
    async fn pull_blob(&self, image: &ImageReference, digest: &str, dest: &Path) -> Result<u64, OciError> {
        let url = format!(
            "{}/v2/{}/blobs/{}",
            self.registry_url(&image.registry),
            image.repository,
            digest
        );

        debug!(url = %url, dest = %dest.display(), "Pulling blob");

        let response = tokio::time::timeout(self.config.layer_timeout, self.get(image, &url, None))
            .await
            .map_err(|_| OciError::Timeout)??;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Download to temporary file, then rename
        let temp_path = dest.with_extension("tmp");
        let bytes = tokio::time::timeout(self.config.layer_timeout, response.bytes())
            .await
            .map_err(|_| OciError::Timeout)??;

        verify_digest(digest, &bytes)?;

        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&bytes).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, dest).await?;

        info!(digest = %digest, size = bytes.len(), "Blob downloaded");
        Ok(bytes.len() as u64)
    }

    /// GET with the bearer-token handshake on 401.
    async fn get(&self, image: &ImageReference, url: &str, accept: Option<&str>) -> Result<Response, OciError> {
        let scope_key = format!("{}/{}", image.registry, image.repository);

        // blob downloads are bounded by the layer timeout
        let timeout = match accept {
            Some(_) => self.config.request_timeout,
            None => self.config.layer_timeout,
        };

        let mut retried = false;
        loop {
            let mut request = self.client.get(url).timeout(timeout);
            if let Some(accept) = accept {
                request = request.header(ACCEPT, accept);
            }
            if let Some(token) = self.tokens.lock().await.get(&scope_key) {
                request = request.bearer_auth(token);
            }

            let response = request.send().await?;
            match response.status() {
                StatusCode::OK => return Ok(response),
                StatusCode::NOT_FOUND => return Err(OciError::NotFound(url.to_string())),
                StatusCode::UNAUTHORIZED if !retried => {
                    let challenge = response
                        .headers()
                        .get(WWW_AUTHENTICATE)
                        .and_then(|v| v.to_str().ok())
                        .ok_or_else(|| OciError::AuthRequired(url.to_string()))?
                        .to_string();
                    let token = self.fetch_token(&challenge, &image.repository).await?;
                    self.tokens.lock().await.insert(scope_key.clone(), token);
                    retried = true;
                }
                StatusCode::UNAUTHORIZED => return Err(OciError::AuthRequired(url.to_string())),
                status => {
                    return Err(OciError::Status {
                        status: status.as_u16(),
                        url: url.to_string(),
                    })
                }
            }
        }
    }

    /// Obtain an anonymous pull token from the realm named in the challenge.
    async fn fetch_token(&self, challenge: &str, repository: &str) -> Result<String, OciError> {
        let params = parse_bearer_challenge(challenge)
            .ok_or_else(|| OciError::AuthRequired(format!("unsupported challenge: {challenge}")))?;
        let realm = params
            .get("realm")
            .ok_or_else(|| OciError::AuthRequired(format!("challenge without realm: {challenge}")))?;

        let scope = params
            .get("scope")
            .cloned()
            .unwrap_or_else(|| format!("repository:{repository}:pull"));
        let mut query = vec![("scope", scope)];
        if let Some(service) = params.get("service") {
            query.push(("service", service.clone()));
        }

        debug!(realm = %realm, "Requesting registry token");
        let response = self
            .client
            .get(realm)
            .query(&query)
            .timeout(self.config.request_timeout)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(OciError::AuthRequired(format!(
                "token request to {realm} returned {}",
                response.status()
            )));
        }

        let token: TokenResponse = response.json().await?;
        token
            .token
            .or(token.access_token)
            .ok_or_else(|| OciError::AuthRequired(format!("no token in response from {realm}")))
    }

    /// Get the local path for a blob.
    pub fn blob_path(&self, digest: &str) -> PathBuf {
        // digest format: "sha256:abc123..."
        match digest.split_once(':') {
            Some((algorithm, hash)) => self.config.blob_dir.join(algorithm).join(hash),
            None => self.config.blob_dir.join(digest),
        }
    }
}

fn verify_digest(expected: &str, body: &[u8]) -> Result<(), OciError> {
    let computed = format!("sha256:{}", hex::encode(Sha256::digest(body)));
    if computed != expected {
        return Err(OciError::DigestMismatch {
            expected: expected.to_string(),
            actual: computed,
        });
    }
    Ok(())
}

/// Parse `Bearer realm="...",service="...",scope="..."`.
fn parse_bearer_challenge(challenge: &str) -> Option<HashMap<String, String>> {
    let (scheme, rest) = challenge.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }

    let mut params = HashMap::new();
    let mut rest = rest.trim();
    while !rest.is_empty() {
        let (key, after_key) = rest.split_once('=')?;
        let after_key = after_key.trim_start();
        let (value, remainder) = match after_key.strip_prefix('"') {
            Some(quoted) => {
                let end = quoted.find('"')?;
                (&quoted[..end], &quoted[end + 1..])
            }
            None => match after_key.find(',') {
                Some(end) => (&after_key[..end], &after_key[end..]),
                None => (after_key, ""),
            },
        };
        params.insert(key.trim().to_ascii_lowercase(), value.to_string());
        rest = remainder.trim_start().trim_start_matches(',').trim_start();
    }

    Some(params)
}
