//! kubelet health and credential rebootstrap.

use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use gardener_osc::constants::KUBELET_UNIT_NAME;
use gardener_reconcile::until_timeout;
use serde_yaml::{Mapping, Value};
use thiserror::Error;
use tracing::{debug, info};

use crate::fs::{write_atomic, FileSystem, FsError, DEFAULT_DIR_PERMISSIONS};
use crate::paths::NodePaths;
use crate::systemd::{SystemdControl, SystemdError};

pub const DEFAULT_HEALTH_ENDPOINT: &str = "http://127.0.0.1:10248/healthz";
pub const DEFAULT_HEALTH_INTERVAL: Duration = Duration::from_secs(5);
pub const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(5 * 60);

const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Auth info the kubelet's kubeconfig refers to.
const AUTH_INFO_NAME: &str = "default-auth";

#[derive(Debug, Error)]
pub enum KubeletError {
    #[error(transparent)]
    Fs(#[from] FsError),

    #[error("kubelet client certificate {0:?} not found")]
    MissingClientCertificate(PathBuf),

    #[error("kubeconfig {0:?} not found")]
    MissingKubeconfig(PathBuf),

    #[error("unable to process kubeconfig {path:?}: {source}")]
    Kubeconfig {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("kubeconfig {0:?} is not a mapping")]
    InvalidKubeconfig(PathBuf),

    #[error(transparent)]
    Systemd(#[from] SystemdError),

    #[error("kubelet did not become healthy within {timeout:?}")]
    NotHealthy { timeout: Duration },
}

/// Health of the local kubelet.
#[async_trait]
pub trait KubeletHealth: Send + Sync {
    /// A single probe. Unreachable counts as unhealthy.
    async fn is_healthy(&self) -> bool;
}

/// Probes the kubelet's healthz endpoint; HTTP 200 means healthy.
pub struct HttpKubeletHealth {
    client: reqwest::Client,
    url: String,
}

impl HttpKubeletHealth {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl KubeletHealth for HttpKubeletHealth {
    async fn is_healthy(&self) -> bool {
        let response = self
            .client
            .get(&self.url)
            .timeout(HEALTH_REQUEST_TIMEOUT)
            .send()
            .await;

        match response {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                debug!(url = %self.url, status = %response.status(), "kubelet not healthy yet");
                false
            }
            Err(e) => {
                debug!(url = %self.url, error = %e, "kubelet health endpoint not reachable");
                false
            }
        }
    }
}

/// Poll `health` every `interval` until it reports healthy or `timeout` passes.
pub async fn wait_until_healthy(
    health: &dyn KubeletHealth,
    interval: Duration,
    timeout: Duration,
) -> Result<(), KubeletError> {
    until_timeout(interval, timeout, move || async move {
        Ok::<_, Infallible>(health.is_healthy().await)
    })
    .await
    .map_err(|_| KubeletError::NotHealthy { timeout })?;

    info!("kubelet is healthy");
    Ok(())
}

/// Make the kubelet request a new client certificate after a CA rotation.
///
/// The current client certificate is copied aside and referenced from a fresh
/// bootstrap kubeconfig, the kubelet's PKI and real kubeconfig are removed and
/// the kubelet is restarted.
pub async fn rebootstrap(
    fs: &dyn FileSystem,
    systemd: &dyn SystemdControl,
    paths: &NodePaths,
    tmp_dir: &Path,
) -> Result<(), KubeletError> {
    let certificate_path = paths.kubelet_client_certificate();
    let certificate = fs
        .read(&certificate_path)
        .await?
        .ok_or(KubeletError::MissingClientCertificate(certificate_path))?;

    let temp_certificate = paths.kubelet_temp_client_certificate();
    if let Some(dir) = temp_certificate.parent() {
        fs.create_dir_all(dir, DEFAULT_DIR_PERMISSIONS).await?;
    }
    fs.write(&temp_certificate, &certificate, 0o600).await?;
    debug!(path = %temp_certificate.display(), "Copied kubelet client certificate aside");

    let real = paths.kubeconfig_real();
    let raw = fs
        .read(&real)
        .await?
        .ok_or_else(|| KubeletError::MissingKubeconfig(real.clone()))?;
    let bootstrap = bootstrap_kubeconfig(&raw, &temp_certificate).map_err(|e| match e {
        KubeconfigError::Yaml(source) => KubeletError::Kubeconfig {
            path: real.clone(),
            source,
        },
        KubeconfigError::NotAMapping => KubeletError::InvalidKubeconfig(real.clone()),
    })?;
    write_atomic(fs, tmp_dir, &paths.kubeconfig_bootstrap(), &bootstrap, 0o600).await?;

    fs.remove_dir_all(&paths.kubelet_pki_dir()).await?;
    fs.remove_file(&real).await?;

    systemd.restart(KUBELET_UNIT_NAME).await?;

    if let Some(dir) = temp_certificate.parent() {
        fs.remove_dir_all(dir).await?;
    }
    info!("Restarted kubelet with bootstrap credentials after CA rotation");
    Ok(())
}

enum KubeconfigError {
    Yaml(serde_yaml::Error),
    NotAMapping,
}

/// The real kubeconfig with its users replaced by `default-auth` pointing at
/// `certificate` for both certificate and key.
fn bootstrap_kubeconfig(raw: &[u8], certificate: &Path) -> Result<Vec<u8>, KubeconfigError> {
    let mut config: Value = serde_yaml::from_slice(raw).map_err(KubeconfigError::Yaml)?;
    let root = config.as_mapping_mut().ok_or(KubeconfigError::NotAMapping)?;

    let certificate = certificate.display().to_string();
    let mut user = Mapping::new();
    user.insert("client-certificate".into(), certificate.clone().into());
    user.insert("client-key".into(), certificate.into());

    let mut auth_info = Mapping::new();
    auth_info.insert("name".into(), AUTH_INFO_NAME.into());
    auth_info.insert("user".into(), Value::Mapping(user));
    root.insert("users".into(), Value::Sequence(vec![Value::Mapping(auth_info)]));

    if let Some(Value::Sequence(contexts)) = root.get_mut("contexts") {
        for context in contexts {
            if let Some(Value::Mapping(context)) = context.get_mut("context") {
                context.insert("user".into(), AUTH_INFO_NAME.into());
            }
        }
    }

    serde_yaml::to_string(&config)
        .map(String::into_bytes)
        .map_err(KubeconfigError::Yaml)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::systemd::UnitOperation;
    use crate::testing::{MemoryFileSystem, RecordingSystemd};

    const KUBECONFIG: &str = r#"
apiVersion: v1
kind: Config
clusters:
- name: default-cluster
  cluster:
    server: https://api.example.com
    certificate-authority-data: Q0E=
contexts:
- name: default-context
  context:
    cluster: default-cluster
    user: default-auth
current-context: default-context
users:
- name: default-auth
  user:
    client-certificate: /var/lib/kubelet/pki/kubelet-client-current.pem
    client-key: /var/lib/kubelet/pki/kubelet-client-current.pem
"#;

    #[tokio::test]
    async fn test_rebootstrap_file_choreography() {
        let fs = Arc::new(MemoryFileSystem::new());
        let systemd = RecordingSystemd::new();
        let paths = NodePaths::default();
        fs.insert_file("/var/lib/kubelet/pki/kubelet-client-current.pem", b"CERT", 0o600);
        fs.insert_file("/var/lib/kubelet/pki/kubelet-server.crt", b"SERVER", 0o600);
        fs.insert_file("/var/lib/kubelet/kubeconfig-real", KUBECONFIG.as_bytes(), 0o600);

        rebootstrap(fs.as_ref(), &systemd, &paths, Path::new("/var/lib/gardener-node-agent/tmp/x"))
            .await
            .unwrap();

        assert!(!fs.is_dir("/var/lib/kubelet/pki"));
        assert!(fs.file("/var/lib/kubelet/pki/temp/kubelet-client-current.pem").is_none());
        assert!(fs.file("/var/lib/kubelet/kubeconfig-real").is_none());
        assert_eq!(
            systemd.calls(),
            vec![(UnitOperation::Restart, KUBELET_UNIT_NAME.to_string())]
        );

        let bootstrap: Value =
            serde_yaml::from_slice(&fs.file("/var/lib/kubelet/kubeconfig-bootstrap").unwrap()).unwrap();
        let users = bootstrap["users"].as_sequence().unwrap();
        assert_eq!(users.len(), 1);
        assert_eq!(users[0]["name"].as_str(), Some("default-auth"));
        assert_eq!(
            users[0]["user"]["client-certificate"].as_str(),
            Some("/var/lib/kubelet/pki/temp/kubelet-client-current.pem")
        );
        assert_eq!(
            users[0]["user"]["client-key"].as_str(),
            Some("/var/lib/kubelet/pki/temp/kubelet-client-current.pem")
        );
        assert_eq!(bootstrap["clusters"][0]["cluster"]["server"].as_str(), Some("https://api.example.com"));
        assert_eq!(bootstrap["current-context"].as_str(), Some("default-context"));
    }

    #[tokio::test]
    async fn test_rebootstrap_requires_client_certificate() {
        let fs = MemoryFileSystem::new();
        let systemd = RecordingSystemd::new();
        fs.insert_file("/var/lib/kubelet/kubeconfig-real", KUBECONFIG.as_bytes(), 0o600);

        let err = rebootstrap(&fs, &systemd, &NodePaths::default(), Path::new("/tmp/x"))
            .await
            .unwrap_err();

        assert!(matches!(err, KubeletError::MissingClientCertificate(_)));
        assert!(systemd.calls().is_empty());
        assert!(fs.file("/var/lib/kubelet/kubeconfig-real").is_some());
    }

    #[tokio::test]
    async fn test_health_probe() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/healthz"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let healthy = HttpKubeletHealth::new(reqwest::Client::new(), format!("{}/healthz", server.uri()));
        assert!(healthy.is_healthy().await);

        let missing = HttpKubeletHealth::new(reqwest::Client::new(), format!("{}/other", server.uri()));
        assert!(!missing.is_healthy().await);
    }

    #[tokio::test]
    async fn test_wait_until_healthy_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let health = HttpKubeletHealth::new(reqwest::Client::new(), format!("{}/healthz", server.uri()));
        let err = wait_until_healthy(&health, Duration::from_millis(10), Duration::from_millis(100))
            .await
            .unwrap_err();

        assert!(matches!(err, KubeletError::NotHealthy { .. }));
        assert!(server.received_requests().await.unwrap().len() > 1);
    }
}
