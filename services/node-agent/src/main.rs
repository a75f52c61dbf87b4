//! Gardener node agent
//!
//! Converges the node's files, systemd units and containerd configuration to
//! the OperatingSystemConfig of its worker pool.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use gardener_node_agent::config::{NodeAgentConfig, SourceSelection};
use gardener_node_agent::controller::{Capabilities, Controller};
use gardener_node_agent::fs::HostFileSystem;
use gardener_node_agent::image::{OciConfig, OciImageExtractor};
use gardener_node_agent::kube::{KubeClient, KubeClientConfig, SecretConfigSource};
use gardener_node_agent::kubelet::HttpKubeletHealth;
use gardener_node_agent::node::NodeApi;
use gardener_node_agent::osupdate::BashUpdateExecutor;
use gardener_node_agent::reconciler::{ExitReason, Reconciler};
use gardener_node_agent::signals::ShutdownSignals;
use gardener_node_agent::source::{ConfigSource, FileConfigSource};
use gardener_node_agent::systemd::SystemctlClient;

#[tokio::main]
async fn main() -> Result<()> {
    let config = NodeAgentConfig::parse();

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| config.log_level.as_str().into()))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("Starting gardener node agent");

    config.validate()?;
    let paths = config.paths();
    let settings = config.controller_settings()?;
    info!(
        hostname = %settings.hostname,
        node_name = ?settings.node_name,
        base_dir = %config.base_dir.display(),
        root = %config.root.display(),
        "Configuration loaded"
    );

    let host_fs = HostFileSystem::rooted(&config.root);
    let http = reqwest::Client::builder()
        .build()
        .context("unable to build HTTP client")?;

    let server = config.api_server.clone().context("--api-server must be set")?;
    let kube = Arc::new(
        KubeClient::new(KubeClientConfig {
            server,
            token_file: Some(config.token_file.clone()),
            ca_file: config.ca_file.clone(),
            timeout: config.api_timeout(),
        })
        .context("unable to create API server client")?,
    );

    let source: Arc<dyn ConfigSource> = match config.source()? {
        SourceSelection::File(path) => Arc::new(FileConfigSource::new(host_fs.resolve(&path))),
        SourceSelection::Secret(name) => Arc::new(SecretConfigSource::new(kube.clone(), name)),
    };
    let node_api: Arc<dyn NodeApi> = kube;

    let fs = Arc::new(host_fs.clone());
    let images = OciImageExtractor::new(
        OciConfig {
            blob_dir: host_fs.resolve(&paths.image_cache),
            ..OciConfig::default()
        },
        fs.clone(),
        paths.tmp_dir.clone(),
    )
    .context("unable to create image extractor")?;

    let caps = Capabilities {
        source,
        node_api,
        fs,
        systemd: Arc::new(SystemctlClient::new()),
        images: Arc::new(images),
        os_update: Arc::new(BashUpdateExecutor::new()),
        kubelet_health: Arc::new(HttpKubeletHealth::new(http.clone(), config.kubelet_health_endpoint.clone())),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let signals = ShutdownSignals::install().context("unable to install signal handlers")?;
    tokio::spawn(signals.forward(shutdown_tx.clone()));

    let controller = Controller::new(caps, paths, settings, http, shutdown_tx);
    let reason = Reconciler::new(controller, config.reconciler_config())
        .run(shutdown_rx)
        .await;

    match reason {
        ExitReason::Shutdown => info!("Node agent shutdown complete"),
        ExitReason::RestartSelf => info!("Exiting to let systemd restart the agent with its new unit"),
    }
    Ok(())
}
