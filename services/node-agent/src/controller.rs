//! Convergence controller: one reconciliation pass as a fixed sequence of
//! stages.
//!
//! A pass loads the desired configuration, diffs it against the persisted
//! baseline and walks the stages of [`Stage::ALL`] in order, skipping the
//! ones that do not apply. The node is annotated with the applied checksum
//! only after every other stage succeeded.

use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gardener_osc::constants::CONTAINERD_UNIT_NAME;
use gardener_osc::{compute_changes, MergedConfig, OperatingSystemConfig, OperatingSystemConfigChanges};
use gardener_reconcile::{Checksum, Outcome, DEFAULT_REQUEUE_DELAY};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::applier::{plan_unit_commands, Applier};
use crate::baseline::BaselineStore;
use crate::containerd::ContainerdReconciler;
use crate::error::{PassError, StageError};
use crate::fs::FileSystem;
use crate::image::ImageExtractor;
use crate::kubelet::{self, KubeletHealth, DEFAULT_HEALTH_INTERVAL, DEFAULT_HEALTH_TIMEOUT};
use crate::node::{
    Node, NodeApi, NodePatch, ANNOTATION_CHECKSUM_APPLIED, ANNOTATION_UPDATING_OS_VERSION,
    LABEL_KUBERNETES_VERSION, LABEL_MACHINE_READY_FOR_UPDATE, LABEL_MACHINE_UPDATE_SUCCESSFUL,
};
use crate::osrelease::current_os_version;
use crate::osupdate::OsUpdateExecutor;
use crate::paths::NodePaths;
use crate::source::{ConfigBlob, ConfigSource, SourceError};
use crate::stages::Stage;
use crate::systemd::SystemdControl;

/// Prefix of the per-pass temporary directories.
pub const TEMP_DIR_PREFIX: &str = "osc-reconciliation-file-";

pub const DEFAULT_UNIT_COMMAND_PARALLELISM: usize = 10;
pub const DEFAULT_REGISTRY_WAIT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// The collaborators a controller acts through.
#[derive(Clone)]
pub struct Capabilities {
    pub source: Arc<dyn ConfigSource>,
    pub node_api: Arc<dyn NodeApi>,
    pub fs: Arc<dyn FileSystem>,
    pub systemd: Arc<dyn SystemdControl>,
    pub images: Arc<dyn ImageExtractor>,
    pub os_update: Arc<dyn OsUpdateExecutor>,
    pub kubelet_health: Arc<dyn KubeletHealth>,
}

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Node name; looked up by hostname label when unset.
    pub node_name: Option<String>,
    pub hostname: String,

    /// Written to the node as the worker's Kubernetes version label.
    pub kubernetes_version: Option<String>,

    pub unit_command_parallelism: usize,
    pub kubelet_health_interval: Duration,
    pub kubelet_health_timeout: Duration,
    pub registry_wait_timeout: Duration,

    /// Delay of passes that wait for the node (registration, drain).
    pub requeue_delay: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            node_name: None,
            hostname: String::new(),
            kubernetes_version: None,
            unit_command_parallelism: DEFAULT_UNIT_COMMAND_PARALLELISM,
            kubelet_health_interval: DEFAULT_HEALTH_INTERVAL,
            kubelet_health_timeout: DEFAULT_HEALTH_TIMEOUT,
            registry_wait_timeout: DEFAULT_REGISTRY_WAIT_TIMEOUT,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
        }
    }
}

/// What a finished pass did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PassReport {
    pub outcome: Outcome,

    /// Stages that ran, in order.
    pub stages: Vec<Stage>,

    /// The agent's own unit changed and the shutdown signal was sent.
    pub restart_self: bool,
}

impl PassReport {
    pub fn ran(&self, stage: Stage) -> bool {
        self.stages.contains(&stage)
    }
}

/// Desired state of one pass.
struct LoadedConfig {
    blob: ConfigBlob,
    desired: MergedConfig,
    changes: OperatingSystemConfigChanges,
}

/// Runs reconciliation passes for one node.
pub struct Controller {
    caps: Capabilities,
    paths: NodePaths,
    settings: ControllerSettings,
    applier: Applier,
    containerd: ContainerdReconciler,
    baseline: BaselineStore,
    shutdown: watch::Sender<bool>,

    /// Name of the node once it was resolved.
    node_name: Option<String>,

    /// Checksum of the configuration this node converged to.
    last_applied: Option<Checksum>,
}

impl Controller {
    pub fn new(
        caps: Capabilities,
        paths: NodePaths,
        settings: ControllerSettings,
        http: reqwest::Client,
        shutdown: watch::Sender<bool>,
    ) -> Self {
        let applier = Applier::new(
            caps.fs.clone(),
            caps.systemd.clone(),
            caps.images.clone(),
            paths.clone(),
        );
        let containerd = ContainerdReconciler::new(caps.fs.clone(), paths.clone(), http);
        let baseline = BaselineStore::new(caps.fs.clone(), paths.baseline.clone(), paths.tmp_dir.clone());

        Self {
            caps,
            paths,
            settings,
            applier,
            containerd,
            baseline,
            shutdown,
            node_name: None,
            last_applied: None,
        }
    }

    pub fn node_name(&self) -> Option<&str> {
        self.node_name.as_deref()
    }

    pub fn last_applied(&self) -> Option<&Checksum> {
        self.last_applied.as_ref()
    }

    /// Whether the source carries a configuration this node has not
    /// converged to yet.
    pub async fn has_new_config(&self) -> Result<bool, SourceError> {
        let Some(blob) = self.caps.source.fetch().await? else {
            return Ok(false);
        };
        Ok(self.last_applied.as_ref() != Some(&blob.checksum))
    }

    /// Run one pass.
    pub async fn reconcile(&mut self) -> Result<PassReport, PassError> {
        let mut stages = Vec::new();

        let Some(loaded) = run_stage(&mut stages, Stage::LoadConfig, self.load_config()).await? else {
            info!("No operating system config available yet");
            return Ok(PassReport {
                outcome: Outcome::Done,
                stages,
                restart_self: false,
            });
        };

        let tmp_dir = self
            .caps
            .fs
            .temp_dir(&self.paths.tmp_dir, TEMP_DIR_PREFIX)
            .await
            .map_err(|e| PassError::new(Stage::LoadConfig, e))?;

        let result = self.converge(&loaded, &tmp_dir, &mut stages).await;

        if let Err(e) = self.caps.fs.remove_dir_all(&tmp_dir).await {
            warn!(path = %tmp_dir.display(), error = %e, "Unable to remove temporary directory");
        }

        let (outcome, restart_self) = result?;
        Ok(PassReport {
            outcome,
            stages,
            restart_self,
        })
    }

    async fn load_config(&self) -> Result<Option<LoadedConfig>, StageError> {
        let Some(blob) = self.caps.source.fetch().await? else {
            return Ok(None);
        };

        let os_version = current_os_version(self.caps.fs.as_ref(), &self.paths.os_release).await?;

        let previous = match self.baseline.load().await? {
            Some(raw) => match OperatingSystemConfig::decode_merged(&raw) {
                Ok(previous) => Some(previous),
                Err(e) => {
                    warn!(
                        path = %self.paths.baseline.display(),
                        error = %e,
                        "Persisted configuration is unreadable, applying everything"
                    );
                    None
                }
            },
            None => None,
        };

        let desired = OperatingSystemConfig::decode_merged(&blob.raw)?;
        let changes = compute_changes(previous.as_ref(), &desired, os_version.as_deref());

        debug!(
            checksum = %blob.checksum,
            os_version = ?os_version,
            changed_files = changes.files.changed.len(),
            deleted_files = changes.files.deleted.len(),
            changed_units = changes.units.changed.len(),
            deleted_units = changes.units.deleted.len(),
            in_place = changes.is_in_place_update(),
            "Computed changes"
        );

        Ok(Some(LoadedConfig {
            blob,
            desired,
            changes,
        }))
    }

    async fn converge(
        &mut self,
        loaded: &LoadedConfig,
        tmp_dir: &Path,
        stages: &mut Vec<Stage>,
    ) -> Result<(Outcome, bool), PassError> {
        let LoadedConfig {
            blob,
            desired,
            changes,
        } = loaded;
        let in_place = changes.is_in_place_update();

        let mut node = run_stage(stages, Stage::FetchNode, self.fetch_node()).await?;
        if let Some(node) = &node {
            if node.annotation(ANNOTATION_CHECKSUM_APPLIED) == Some(blob.checksum.as_str()) {
                info!(node = %node.name, checksum = %blob.checksum, "Configuration on this node is up to date");
                self.last_applied = Some(blob.checksum.clone());
                return Ok((Outcome::Done, false));
            }
        }

        if in_place {
            let ready = run_stage(stages, Stage::CheckInPlacePreconditions, async {
                Ok::<_, StageError>(
                    node.as_ref()
                        .is_some_and(|n| n.label(LABEL_MACHINE_READY_FOR_UPDATE).is_some()),
                )
            })
            .await?;

            if !ready {
                info!(node = ?self.node_name, "Node is not ready for in-place update, requeuing");
                return Ok((Outcome::RequeueAfter(self.settings.requeue_delay), false));
            }
        }

        if changes.os_version.changed {
            run_stage(
                stages,
                Stage::UpdateOperatingSystem,
                self.update_operating_system(node.as_mut(), desired, &changes.os_version.version),
            )
            .await?;
        }

        // enforced on every pass so drift on the node is repaired
        let containerd_config_written = run_stage(
            stages,
            Stage::ApplyContainerdConfig,
            self.containerd.apply_config(tmp_dir, desired.cri_config.as_ref()),
        )
        .await?;

        run_stage(
            stages,
            Stage::ApplyInlineFiles,
            self.applier.apply_inline_files(tmp_dir, &changes.files.changed),
        )
        .await?;

        let probes = run_stage(
            stages,
            Stage::ApplyContainerdRegistries,
            self.containerd.apply_registries(tmp_dir, &changes.containerd.registries),
        )
        .await?;

        run_stage(
            stages,
            Stage::ApplyImageRefFiles,
            self.applier.apply_image_ref_files(&changes.files.changed),
        )
        .await?;

        run_stage(
            stages,
            Stage::ApplyChangedUnits,
            self.applier.apply_changed_units(tmp_dir, &changes.units.changed),
        )
        .await?;

        run_stage(
            stages,
            Stage::RemoveDeletedUnits,
            self.applier.remove_deleted_units(&changes.units.deleted),
        )
        .await?;

        if !changes.is_empty() {
            run_stage(stages, Stage::ReloadDaemon, self.applier.reload_daemon()).await?;
            // removed units may have stopped containerd through its drop-ins
            run_stage(
                stages,
                Stage::StartContainerd,
                self.applier.start_unit(CONTAINERD_UNIT_NAME),
            )
            .await?;
        }

        let mut plan = plan_unit_commands(changes);
        if containerd_config_written {
            plan.ensure_restart(CONTAINERD_UNIT_NAME);
        }
        run_stage(
            stages,
            Stage::ExecuteUnitCommands,
            self.applier
                .execute_unit_commands(&plan.actions, self.settings.unit_command_parallelism),
        )
        .await?;

        if changes.ca_rotation {
            run_stage(
                stages,
                Stage::RebootstrapKubelet,
                kubelet::rebootstrap(
                    self.caps.fs.as_ref(),
                    self.caps.systemd.as_ref(),
                    &self.paths,
                    tmp_dir,
                ),
            )
            .await?;
        }

        if changes.kubelet_update.minor_version_update {
            run_stage(
                stages,
                Stage::WaitForKubelet,
                kubelet::wait_until_healthy(
                    self.caps.kubelet_health.as_ref(),
                    self.settings.kubelet_health_interval,
                    self.settings.kubelet_health_timeout,
                ),
            )
            .await?;
        }

        run_stage(
            stages,
            Stage::WaitForRegistries,
            probes.wait(self.settings.registry_wait_timeout),
        )
        .await?;

        run_stage(
            stages,
            Stage::RemoveDeletedFiles,
            self.applier.remove_deleted_files(&changes.files.deleted),
        )
        .await?;

        if in_place {
            if let Some(node) = &node {
                run_stage(stages, Stage::EvictPods, self.evict_pods(node, desired.os_version())).await?;
            }
        }

        run_stage(stages, Stage::PersistBaseline, self.baseline.persist(&blob.raw)).await?;

        info!(
            changed_files = changes.files.changed.len(),
            deleted_files = changes.files.deleted.len(),
            changed_units = changes.units.changed.len(),
            deleted_units = changes.units.deleted.len(),
            "Successfully applied operating system config"
        );

        if plan.restart_self {
            run_stage(stages, Stage::RestartSelf, async {
                self.shutdown.send_replace(true);
                Ok::<_, StageError>(())
            })
            .await?;
            info!("Own unit changed, shutting down to be restarted");
            return Ok((Outcome::Done, true));
        }

        let Some(node) = node else {
            info!("Waiting for the node to be registered, requeuing");
            return Ok((Outcome::RequeueAfter(self.settings.requeue_delay), false));
        };

        run_stage(stages, Stage::RemoveBootstrapFiles, self.remove_bootstrap_files()).await?;
        run_stage(
            stages,
            Stage::AnnotateNode,
            self.annotate_node(&node.name, &blob.checksum),
        )
        .await?;

        self.last_applied = Some(blob.checksum.clone());
        Ok((Outcome::Done, false))
    }

    async fn fetch_node(&mut self) -> Result<Option<Node>, StageError> {
        let api = self.caps.node_api.as_ref();

        if let Some(name) = &self.node_name {
            return Ok(api.get_node(name).await?);
        }

        let node = match &self.settings.node_name {
            Some(name) => api.get_node(name).await?,
            None => api.find_node_by_hostname(&self.settings.hostname).await?,
        };

        if let Some(node) = &node {
            info!(node = %node.name, "Resolved node");
            self.node_name = Some(node.name.clone());
        }
        Ok(node)
    }

    async fn update_operating_system(
        &self,
        node: Option<&mut Node>,
        desired: &MergedConfig,
        version: &str,
    ) -> Result<(), StageError> {
        if let Some(node) = node {
            let patch = NodePatch::default().annotation(ANNOTATION_UPDATING_OS_VERSION, version);
            self.caps.node_api.patch_node(&node.name, &patch).await?;
            patch.apply_to(node);
            info!(node = %node.name, version = %version, "Annotated node for OS update");
        }

        let script = desired
            .update_script_path
            .as_deref()
            .ok_or_else(|| StageError::MissingUpdateScript {
                version: version.to_string(),
            })?;

        self.caps.os_update.run(Path::new(script), version).await?;
        Ok(())
    }

    async fn evict_pods(&self, node: &Node, target_version: Option<&str>) -> Result<(), StageError> {
        let api = self.caps.node_api.as_ref();

        let pods = api.list_pods_on_node(&node.name).await?;
        for pod in &pods {
            api.delete_pod(pod).await?;
        }
        info!(node = %node.name, pods = pods.len(), "Deleted pods for in-place update");

        if node.annotation(ANNOTATION_UPDATING_OS_VERSION).is_none() {
            return Ok(());
        }

        let current = current_os_version(self.caps.fs.as_ref(), &self.paths.os_release).await?;
        match (current.as_deref(), target_version) {
            (Some(current), Some(target)) if current == target => {
                let patch = NodePatch::default().label(LABEL_MACHINE_UPDATE_SUCCESSFUL, "true");
                api.patch_node(&node.name, &patch).await?;
                info!(node = %node.name, version = %current, "OS update successful");
            }
            _ => {
                info!(
                    node = %node.name,
                    version = ?current,
                    expected = ?target_version,
                    "OS version does not match the target yet"
                );
            }
        }
        Ok(())
    }

    async fn remove_bootstrap_files(&self) -> Result<(), StageError> {
        let fs = self.caps.fs.as_ref();
        fs.remove_file(&self.paths.kubeconfig_bootstrap()).await?;
        fs.remove_file(&self.paths.bootstrap_token).await?;
        Ok(())
    }

    async fn annotate_node(&self, name: &str, checksum: &Checksum) -> Result<(), StageError> {
        let mut patch = NodePatch::default().annotation(ANNOTATION_CHECKSUM_APPLIED, checksum.as_str());
        if let Some(version) = &self.settings.kubernetes_version {
            patch = patch.label(LABEL_KUBERNETES_VERSION, version);
        }

        self.caps.node_api.patch_node(name, &patch).await?;
        info!(node = %name, checksum = %checksum, "Node converged");
        Ok(())
    }
}

/// Record `stage`, run it and attach the stage to its error.
async fn run_stage<T, E>(
    stages: &mut Vec<Stage>,
    stage: Stage,
    work: impl Future<Output = Result<T, E>>,
) -> Result<T, PassError>
where
    E: Into<StageError>,
{
    info!(stage = %stage, "Running stage");
    stages.push(stage);
    work.await.map_err(|e| PassError::new(stage, e))
}
