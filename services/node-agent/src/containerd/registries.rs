//! Registry mirrors (`certs.d/<upstream>/hosts.toml`) and their readiness.

use std::path::Path;
use std::time::Duration;

use gardener_osc::{RegistryChanges, RegistryConfig};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use toml::{Table, Value};
use tracing::{debug, info, warn};

use super::{ContainerdError, ContainerdReconciler};
use crate::fs::write_if_changed;

const HOSTS_FILE: &str = "hosts.toml";
const HOSTS_FILE_PERMISSIONS: u32 = 0o644;
const DEFAULT_CAPABILITIES: [&str; 2] = ["pull", "resolve"];

impl ContainerdReconciler {
    /// Write mirror configs of changed registries and drop deleted ones.
    ///
    /// Readiness probes of changed registries start right away; the returned
    /// handle joins them.
    pub async fn apply_registries(
        &self,
        tmp_dir: &Path,
        changes: &RegistryChanges,
    ) -> Result<RegistryProbes, ContainerdError> {
        let fs = self.fs.as_ref();

        for registry in &changes.changed {
            let path = self.paths.registry_hosts_dir(&registry.upstream).join(HOSTS_FILE);
            let written = write_if_changed(
                fs,
                tmp_dir,
                &path,
                render_hosts_toml(registry)?.as_bytes(),
                HOSTS_FILE_PERMISSIONS,
            )
            .await?;
            info!(upstream = %registry.upstream, written, "Reconciled registry mirror");
        }

        for registry in &changes.deleted {
            fs.remove_dir_all(&self.paths.registry_hosts_dir(&registry.upstream))
                .await?;
            info!(upstream = %registry.upstream, "Removed registry mirror");
        }

        let mut probes = RegistryProbes::default();
        for registry in changes
            .changed
            .iter()
            .filter(|r| r.readiness_probe == Some(true))
        {
            probes.spawn(self.http.clone(), registry, self.probe_interval);
        }
        Ok(probes)
    }
}

/// Render the `hosts.toml` of one upstream registry. Hosts keep their
/// declaration order, which is the order containerd tries them in.
pub fn render_hosts_toml(registry: &RegistryConfig) -> Result<String, ContainerdError> {
    let server = registry
        .server
        .clone()
        .unwrap_or_else(|| format!("https://{}", registry.upstream));

    let mut hosts = Table::new();
    for host in &registry.hosts {
        let capabilities: Vec<&str> = if host.capabilities.is_empty() {
            DEFAULT_CAPABILITIES.to_vec()
        } else {
            host.capabilities.iter().map(String::as_str).collect()
        };

        let mut entry = Table::new();
        entry.insert("capabilities".to_string(), Value::from(capabilities));
        if !host.ca_certs.is_empty() {
            entry.insert("ca".to_string(), Value::from(host.ca_certs.clone()));
        }
        hosts.insert(host.url.clone(), Value::Table(entry));
    }

    let mut root = Table::new();
    root.insert("server".to_string(), Value::String(server));
    if !hosts.is_empty() {
        root.insert("host".to_string(), Value::Table(hosts));
    }
    Ok(toml::to_string(&root)?)
}

/// Readiness probes running in the background, one task per registry.
///
/// Probes that are still running when this is dropped are aborted.
#[derive(Default)]
pub struct RegistryProbes {
    probes: Vec<(String, JoinHandle<()>)>,
}

impl RegistryProbes {
    pub fn len(&self) -> usize {
        self.probes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.probes.is_empty()
    }

    fn spawn(&mut self, http: reqwest::Client, registry: &RegistryConfig, interval: Duration) {
        let upstream = registry.upstream.clone();
        let mut urls: Vec<String> = registry.hosts.iter().map(|h| h.url.clone()).collect();
        if urls.is_empty() {
            urls.push(
                registry
                    .server
                    .clone()
                    .unwrap_or_else(|| format!("https://{upstream}")),
            );
        }

        let task_upstream = upstream.clone();
        let handle = tokio::spawn(async move {
            loop {
                for url in &urls {
                    match http.get(url).send().await {
                        Ok(response) if !response.status().is_server_error() => {
                            info!(upstream = %task_upstream, url = %url, status = %response.status(), "Registry is ready");
                            return;
                        }
                        Ok(response) => {
                            debug!(upstream = %task_upstream, url = %url, status = %response.status(), "Registry not ready yet");
                        }
                        Err(e) => {
                            debug!(upstream = %task_upstream, url = %url, error = %e, "Registry not reachable yet");
                        }
                    }
                }
                tokio::time::sleep(interval).await;
            }
        });

        self.probes.push((upstream, handle));
    }

    /// Wait until every probed registry answered, at most `timeout` overall.
    pub async fn wait(mut self, timeout: Duration) -> Result<(), ContainerdError> {
        let deadline = Instant::now() + timeout;
        let mut pending = Vec::new();

        for (upstream, mut handle) in std::mem::take(&mut self.probes) {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    warn!(upstream = %upstream, error = %e, "Registry probe failed");
                    pending.push(upstream);
                }
                Err(_) => {
                    handle.abort();
                    pending.push(upstream);
                }
            }
        }

        if pending.is_empty() {
            Ok(())
        } else {
            Err(ContainerdError::RegistriesNotReady {
                upstreams: pending,
                timeout,
            })
        }
    }
}

impl Drop for RegistryProbes {
    fn drop(&mut self) {
        for (_, handle) in &self.probes {
            handle.abort();
        }
    }
}
