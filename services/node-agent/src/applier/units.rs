//! systemd unit files, drop-ins and lifecycle commands.

use std::path::Path;

use futures_util::stream::{self, StreamExt};
use gardener_osc::constants::{CONTAINERD_UNIT_NAME, DEFAULT_FILE_PERMISSIONS, NODE_AGENT_UNIT_NAME};
use gardener_osc::{ChangedUnit, OperatingSystemConfigChanges, Unit};
use tracing::{debug, info, warn};

use super::{Applier, ApplyError};
use crate::fs::{write_if_changed, FsError, DEFAULT_DIR_PERMISSIONS};
use crate::systemd::{SystemdError, UnitOperation};

/// A start/stop/restart to issue after the daemon reload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitAction {
    pub unit: String,
    pub operation: UnitOperation,
}

impl UnitAction {
    pub fn new(unit: impl Into<String>, operation: UnitOperation) -> Self {
        Self {
            unit: unit.into(),
            operation,
        }
    }
}

/// Commands derived from the changed units.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitCommandPlan {
    pub actions: Vec<UnitAction>,

    /// The agent's own unit changed; it restarts by exiting.
    pub restart_self: bool,
}

impl UnitCommandPlan {
    /// Queue a restart of `unit` unless it already has a command.
    pub fn ensure_restart(&mut self, unit: &str) {
        if !self.actions.iter().any(|a| a.unit == unit) {
            self.actions.push(UnitAction::new(unit, UnitOperation::Restart));
        }
    }
}

/// Decide which command each changed unit receives.
///
/// The agent's own unit is never part of the fan-out. A changed containerd
/// config restarts containerd even when its unit is unchanged.
pub fn plan_unit_commands(changes: &OperatingSystemConfigChanges) -> UnitCommandPlan {
    let mut plan = UnitCommandPlan::default();

    for ChangedUnit { unit, .. } in &changes.units.changed {
        if unit.name == NODE_AGENT_UNIT_NAME {
            plan.restart_self = true;
            continue;
        }
        let operation = if unit.wants_stop() {
            UnitOperation::Stop
        } else {
            UnitOperation::Restart
        };
        plan.actions.push(UnitAction::new(&unit.name, operation));
    }

    if changes.containerd.config_file_changed {
        plan.ensure_restart(CONTAINERD_UNIT_NAME);
    }

    plan
}

fn unit_files_error(unit: &str) -> impl Fn(FsError) -> ApplyError + '_ {
    move |source| ApplyError::UnitFiles {
        unit: unit.to_string(),
        source,
    }
}

impl Applier {
    /// Write unit files and drop-ins of changed units and set their enablement.
    pub async fn apply_changed_units(&self, tmp_dir: &Path, units: &[ChangedUnit]) -> Result<(), ApplyError> {
        let fs = self.fs.as_ref();

        for changed in units {
            let unit = &changed.unit;
            let name = unit.name.as_str();

            if let Some(content) = &unit.content {
                let unit_file = self.paths.unit_file(name);
                let written = write_if_changed(fs, tmp_dir, &unit_file, content.as_bytes(), DEFAULT_FILE_PERMISSIONS)
                    .await
                    .map_err(unit_files_error(name))?;
                debug!(unit = %name, written, "Reconciled unit file");
            }

            let drop_in_dir = self.paths.drop_in_dir(name);
            if unit.drop_ins.is_empty() {
                fs.remove_dir_all(&drop_in_dir)
                    .await
                    .map_err(unit_files_error(name))?;
            } else {
                fs.create_dir_all(&drop_in_dir, DEFAULT_DIR_PERMISSIONS)
                    .await
                    .map_err(unit_files_error(name))?;

                for drop_in in &changed.drop_ins.changed {
                    write_if_changed(
                        fs,
                        tmp_dir,
                        &drop_in_dir.join(&drop_in.name),
                        drop_in.content.as_bytes(),
                        DEFAULT_FILE_PERMISSIONS,
                    )
                    .await
                    .map_err(unit_files_error(name))?;
                }

                for drop_in in &changed.drop_ins.deleted {
                    fs.remove_file(&drop_in_dir.join(&drop_in.name))
                        .await
                        .map_err(unit_files_error(name))?;
                }
            }

            if name == NODE_AGENT_UNIT_NAME || unit.is_enabled() {
                self.systemd.enable(name).await?;
            } else {
                self.systemd.disable(name).await?;
            }

            info!(
                unit = %name,
                changed_drop_ins = changed.drop_ins.changed.len(),
                deleted_drop_ins = changed.drop_ins.deleted.len(),
                "Applied unit"
            );
        }
        Ok(())
    }

    /// Disable, stop and remove units that are no longer configured.
    pub async fn remove_deleted_units(&self, units: &[Unit]) -> Result<(), ApplyError> {
        for unit in units {
            let name = unit.name.as_str();
            if name == NODE_AGENT_UNIT_NAME {
                warn!(unit = %name, "Refusing to remove the agent's own unit");
                continue;
            }

            let unit_file = self.paths.unit_file(name);
            let exists = self
                .fs
                .exists(&unit_file)
                .await
                .map_err(unit_files_error(name))?;

            if exists {
                self.systemd.disable(name).await?;
                self.systemd.stop(name).await?;
                self.fs
                    .remove_file(&unit_file)
                    .await
                    .map_err(unit_files_error(name))?;
            }

            self.fs
                .remove_dir_all(&self.paths.drop_in_dir(name))
                .await
                .map_err(unit_files_error(name))?;

            info!(unit = %name, had_unit_file = exists, "Removed unit");
        }
        Ok(())
    }

    pub async fn reload_daemon(&self) -> Result<(), ApplyError> {
        Ok(self.systemd.daemon_reload().await?)
    }

    pub async fn start_unit(&self, unit: &str) -> Result<(), ApplyError> {
        Ok(self.systemd.start(unit).await?)
    }

    /// Run the planned actions with at most `parallelism` in flight.
    ///
    /// Every action runs even if others fail; all failures are reported.
    pub async fn execute_unit_commands(&self, actions: &[UnitAction], parallelism: usize) -> Result<(), ApplyError> {
        let systemd = &self.systemd;

        let errors: Vec<SystemdError> = stream::iter(actions)
            .map(|action| async move {
                info!(unit = %action.unit, operation = %action.operation, "Executing unit command");
                systemd.run(action.operation, &action.unit).await
            })
            .buffer_unordered(parallelism.max(1))
            .filter_map(|result| async move { result.err() })
            .collect()
            .await;

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ApplyError::UnitCommands(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::Arc;

    use gardener_osc::{ContainerdChanges, DropIn, DropInChanges, UnitCommand, UnitChanges};

    use crate::paths::NodePaths;
    use crate::testing::{MemoryFileSystem, RecordingSystemd, StaticImageExtractor};

    const TMP: &str = "/var/lib/gardener-node-agent/tmp/pass";

    struct Fixture {
        fs: Arc<MemoryFileSystem>,
        systemd: Arc<RecordingSystemd>,
        applier: Applier,
    }

    fn fixture() -> Fixture {
        let fs = Arc::new(MemoryFileSystem::new());
        let systemd = Arc::new(RecordingSystemd::new());
        let applier = Applier::new(
            fs.clone(),
            systemd.clone(),
            Arc::new(StaticImageExtractor::new(fs.clone())),
            NodePaths::default(),
        );
        Fixture { fs, systemd, applier }
    }

    fn unit(name: &str) -> Unit {
        Unit {
            name: name.to_string(),
            content: Some(format!("#{name}")),
            ..Unit::default()
        }
    }

    fn drop_in(name: &str, content: &str) -> DropIn {
        DropIn {
            name: name.to_string(),
            content: content.to_string(),
        }
    }

    fn changed(unit: Unit) -> ChangedUnit {
        let drop_ins = DropInChanges {
            changed: unit.drop_ins.clone(),
            deleted: Vec::new(),
        };
        ChangedUnit { unit, drop_ins }
    }

    fn changes_with_units(units: Vec<Unit>) -> OperatingSystemConfigChanges {
        OperatingSystemConfigChanges {
            units: UnitChanges {
                changed: units.into_iter().map(changed).collect(),
                deleted: Vec::new(),
            },
            ..OperatingSystemConfigChanges::default()
        }
    }

    #[tokio::test]
    async fn test_changed_unit_writes_files_and_enables() {
        let f = fixture();
        let mut u = unit("u1.service");
        u.drop_ins = vec![drop_in("10-override.conf", "#drop")];

        f.applier.apply_changed_units(Path::new(TMP), &[changed(u)]).await.unwrap();

        assert_eq!(f.fs.file("/etc/systemd/system/u1.service").unwrap(), b"#u1.service");
        assert_eq!(f.fs.mode("/etc/systemd/system/u1.service"), Some(0o600));
        assert!(f.fs.is_dir("/etc/systemd/system/u1.service.d"));
        assert_eq!(
            f.fs.file("/etc/systemd/system/u1.service.d/10-override.conf").unwrap(),
            b"#drop"
        );
        assert_eq!(f.systemd.calls(), vec![(UnitOperation::Enable, "u1.service".to_string())]);
    }

    #[tokio::test]
    async fn test_unchanged_unit_content_is_not_rewritten() {
        let f = fixture();
        f.fs.insert_file("/etc/systemd/system/u1.service", b"#u1.service", 0o644);
        let writes = f.fs.write_count();

        f.applier.apply_changed_units(Path::new(TMP), &[changed(unit("u1.service"))]).await.unwrap();

        assert_eq!(f.fs.write_count(), writes);
        assert_eq!(f.fs.mode("/etc/systemd/system/u1.service"), Some(0o600));
    }

    #[tokio::test]
    async fn test_disabled_unit_is_disabled_but_own_unit_is_always_enabled() {
        let f = fixture();
        let mut disabled = unit("u2.service");
        disabled.enable = Some(false);
        let mut own = unit(NODE_AGENT_UNIT_NAME);
        own.enable = Some(false);

        f.applier
            .apply_changed_units(Path::new(TMP), &[changed(disabled), changed(own)])
            .await
            .unwrap();

        assert_eq!(
            f.systemd.calls(),
            vec![
                (UnitOperation::Disable, "u2.service".to_string()),
                (UnitOperation::Enable, NODE_AGENT_UNIT_NAME.to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_drop_in_removal_only_rewrites_directory() {
        let f = fixture();
        f.fs.insert_file("/etc/systemd/system/u1.service.d/old.conf", b"#old", 0o600);
        f.fs.insert_file("/etc/systemd/system/u1.service.d/keep.conf", b"#keep", 0o600);

        let mut u = unit("u1.service");
        u.drop_ins = vec![drop_in("keep.conf", "#keep")];
        let change = ChangedUnit {
            unit: u,
            drop_ins: DropInChanges {
                changed: Vec::new(),
                deleted: vec![drop_in("old.conf", "#old")],
            },
        };

        f.applier.apply_changed_units(Path::new(TMP), &[change]).await.unwrap();

        assert!(f.fs.file("/etc/systemd/system/u1.service.d/old.conf").is_none());
        assert!(f.fs.file("/etc/systemd/system/u1.service.d/keep.conf").is_some());
    }

    #[tokio::test]
    async fn test_drop_in_directory_removed_without_drop_ins() {
        let f = fixture();
        f.fs.insert_file("/etc/systemd/system/u1.service.d/old.conf", b"#old", 0o600);

        let change = ChangedUnit {
            unit: unit("u1.service"),
            drop_ins: DropInChanges {
                changed: Vec::new(),
                deleted: vec![drop_in("old.conf", "#old")],
            },
        };
        f.applier.apply_changed_units(Path::new(TMP), &[change]).await.unwrap();

        assert!(!f.fs.is_dir("/etc/systemd/system/u1.service.d"));
    }

    #[tokio::test]
    async fn test_deleted_unit_is_disabled_stopped_and_removed_in_order() {
        let f = fixture();
        f.fs.insert_file("/etc/systemd/system/u1.service", b"A", 0o600);
        f.fs.insert_file("/etc/systemd/system/u1.service.d/d.conf", b"#d", 0o600);

        f.applier.remove_deleted_units(&[unit("u1.service")]).await.unwrap();

        assert_eq!(
            f.systemd.calls(),
            vec![
                (UnitOperation::Disable, "u1.service".to_string()),
                (UnitOperation::Stop, "u1.service".to_string()),
            ]
        );
        assert!(f.fs.file("/etc/systemd/system/u1.service").is_none());
        assert!(!f.fs.is_dir("/etc/systemd/system/u1.service.d"));
    }

    #[tokio::test]
    async fn test_deleted_unit_without_file_only_drops_directory() {
        let f = fixture();
        f.fs.insert_file("/etc/systemd/system/u1.service.d/d.conf", b"#d", 0o600);

        f.applier.remove_deleted_units(&[unit("u1.service")]).await.unwrap();

        assert!(f.systemd.calls().is_empty());
        assert!(!f.fs.is_dir("/etc/systemd/system/u1.service.d"));
    }

    #[test]
    fn test_plan_restarts_and_stops() {
        let mut stopped = unit("stopped.service");
        stopped.command = Some(UnitCommand::Stop);
        let mut disabled = unit("disabled.service");
        disabled.enable = Some(false);
        disabled.command = Some(UnitCommand::Start);

        let plan = plan_unit_commands(&changes_with_units(vec![
            unit("u3.service"),
            stopped,
            disabled,
        ]));

        assert!(!plan.restart_self);
        assert_eq!(
            plan.actions,
            vec![
                UnitAction::new("u3.service", UnitOperation::Restart),
                UnitAction::new("stopped.service", UnitOperation::Stop),
                UnitAction::new("disabled.service", UnitOperation::Stop),
            ]
        );
    }

    #[test]
    fn test_plan_excludes_own_unit() {
        let plan = plan_unit_commands(&changes_with_units(vec![unit(NODE_AGENT_UNIT_NAME), unit("u1.service")]));

        assert!(plan.restart_self);
        assert_eq!(plan.actions, vec![UnitAction::new("u1.service", UnitOperation::Restart)]);
    }

    #[test]
    fn test_plan_restarts_containerd_once_on_config_change() {
        let mut changes = changes_with_units(vec![unit("u1.service")]);
        changes.containerd = ContainerdChanges {
            config_file_changed: true,
            ..ContainerdChanges::default()
        };
        let plan = plan_unit_commands(&changes);
        assert!(plan
            .actions
            .contains(&UnitAction::new(CONTAINERD_UNIT_NAME, UnitOperation::Restart)));

        let mut changes = changes_with_units(vec![unit(CONTAINERD_UNIT_NAME)]);
        changes.containerd.config_file_changed = true;
        let plan = plan_unit_commands(&changes);
        assert_eq!(plan.actions.len(), 1);
    }

    #[tokio::test]
    async fn test_execute_runs_everything_and_collects_errors() {
        let f = fixture();
        f.systemd.fail_on(UnitOperation::Restart, "bad.service");

        let actions = vec![
            UnitAction::new("u3.service", UnitOperation::Restart),
            UnitAction::new("bad.service", UnitOperation::Restart),
            UnitAction::new("u4.service", UnitOperation::Stop),
        ];
        let err = f.applier.execute_unit_commands(&actions, 2).await.unwrap_err();

        match err {
            ApplyError::UnitCommands(errors) => {
                assert_eq!(errors.len(), 1);
                assert_eq!(errors[0].unit(), "bad.service");
            }
            other => panic!("unexpected error: {other}"),
        }

        let mut calls = f.systemd.calls();
        calls.sort_by(|a, b| a.1.cmp(&b.1));
        assert_eq!(
            calls,
            vec![
                (UnitOperation::Restart, "bad.service".to_string()),
                (UnitOperation::Restart, "u3.service".to_string()),
                (UnitOperation::Stop, "u4.service".to_string()),
            ]
        );
    }
}
