//! Diff engine: computes the change-set between the last applied
//! configuration and the desired one.
//!
//! The change-set lives for exactly one reconciliation pass. Applying it to
//! a node that is in the state described by the baseline yields the desired
//! state.

use std::collections::BTreeSet;

use crate::constants::{KUBELET_CA_PATH, KUBELET_CONFIG_PATH};
use crate::merge::MergedConfig;
use crate::model::{
    CredentialsRotation, CriConfig, DropIn, File, InPlaceUpdates, RegistryConfig, RotationStatus,
    Unit,
};

/// Everything that has to happen on the node in one pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OperatingSystemConfigChanges {
    pub files: FileChanges,
    pub units: UnitChanges,
    pub containerd: ContainerdChanges,
    pub os_version: OsVersionChange,
    pub kubelet_update: KubeletUpdate,
    pub ca_rotation: bool,
    pub sa_key_rotation: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileChanges {
    /// New files and files whose content or permissions changed.
    pub changed: Vec<File>,
    /// Files of the baseline that are no longer desired.
    pub deleted: Vec<File>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitChanges {
    pub changed: Vec<ChangedUnit>,
    pub deleted: Vec<Unit>,
}

/// A unit that must be (re)written and restarted or stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangedUnit {
    pub unit: Unit,
    pub drop_ins: DropInChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DropInChanges {
    pub changed: Vec<DropIn>,
    pub deleted: Vec<DropIn>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerdChanges {
    /// The containerd config (ignoring registries) changed; containerd must restart.
    pub config_file_changed: bool,
    pub registries: RegistryChanges,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryChanges {
    pub changed: Vec<RegistryConfig>,
    pub deleted: Vec<RegistryConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OsVersionChange {
    pub changed: bool,
    /// Target version; empty unless `changed`.
    pub version: String,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KubeletUpdate {
    pub minor_version_update: bool,
    pub config_update: bool,
}

impl OperatingSystemConfigChanges {
    /// True when the pass has nothing to do on the node.
    pub fn is_empty(&self) -> bool {
        self.files.changed.is_empty()
            && self.files.deleted.is_empty()
            && self.units.changed.is_empty()
            && self.units.deleted.is_empty()
            && !self.containerd.config_file_changed
            && self.containerd.registries.changed.is_empty()
            && self.containerd.registries.deleted.is_empty()
            && !self.is_in_place_update()
    }

    /// Whether this pass mutates a live node in place and needs it drained.
    pub fn is_in_place_update(&self) -> bool {
        self.os_version.changed
            || self.kubelet_update.minor_version_update
            || self.kubelet_update.config_update
            || self.ca_rotation
            || self.sa_key_rotation
    }

    /// Whether the given unit is part of the changed set.
    pub fn is_unit_changed(&self, name: &str) -> bool {
        self.units.changed.iter().any(|u| u.unit.name == name)
    }
}

/// Compute the change-set.
///
/// `previous` is the persisted baseline (`None` before the first successful
/// pass), `current_os_version` the version reported by the node's OS.
pub fn compute_changes(
    previous: Option<&MergedConfig>,
    desired: &MergedConfig,
    current_os_version: Option<&str>,
) -> OperatingSystemConfigChanges {
    let empty = MergedConfig::default();
    let previous = previous.unwrap_or(&empty);

    let files = diff_files(previous, desired);
    let changed_paths: BTreeSet<&str> = files.changed.iter().map(|f| f.path.as_str()).collect();
    let units = diff_units(previous, desired, &changed_paths);
    let containerd = diff_containerd(
        previous.cri_config.as_ref(),
        desired.cri_config.as_ref(),
    );

    let os_version = match desired.os_version() {
        Some(target) if Some(target) != current_os_version => OsVersionChange {
            changed: true,
            version: target.to_string(),
        },
        _ => OsVersionChange::default(),
    };

    let mut changes = OperatingSystemConfigChanges {
        files,
        units,
        containerd,
        os_version,
        ..OperatingSystemConfigChanges::default()
    };

    if let (Some(old), Some(new)) = (
        previous.in_place_updates.as_ref(),
        desired.in_place_updates.as_ref(),
    ) {
        changes.kubelet_update = KubeletUpdate {
            minor_version_update: minor_version(&old.kubelet_version)
                != minor_version(&new.kubelet_version),
            config_update: file_differs(previous, desired, KUBELET_CONFIG_PATH),
        };
        changes.ca_rotation = file_differs(previous, desired, KUBELET_CA_PATH)
            || rotation_changed(old, new, |r| r.certificate_authorities.as_ref());
        changes.sa_key_rotation =
            rotation_changed(old, new, |r| r.service_account_key.as_ref());
    }

    changes
}

fn diff_files(previous: &MergedConfig, desired: &MergedConfig) -> FileChanges {
    let changed = desired
        .files
        .iter()
        .filter(|file| previous.file(&file.path) != Some(*file))
        .cloned()
        .collect();

    let deleted = previous
        .files
        .iter()
        .filter(|file| desired.file(&file.path).is_none())
        .cloned()
        .collect();

    FileChanges { changed, deleted }
}

fn diff_units(
    previous: &MergedConfig,
    desired: &MergedConfig,
    changed_paths: &BTreeSet<&str>,
) -> UnitChanges {
    let mut changed = Vec::new();

    for unit in &desired.units {
        let old = previous.unit(&unit.name);
        let definition_changed = old != Some(unit);
        let dependency_changed = unit
            .file_paths
            .iter()
            .any(|p| changed_paths.contains(p.as_str()));

        if definition_changed || dependency_changed {
            changed.push(ChangedUnit {
                unit: unit.clone(),
                drop_ins: diff_drop_ins(old, unit),
            });
        }
    }

    let deleted = previous
        .units
        .iter()
        .filter(|unit| desired.unit(&unit.name).is_none())
        .cloned()
        .collect();

    UnitChanges { changed, deleted }
}

fn diff_drop_ins(old: Option<&Unit>, new: &Unit) -> DropInChanges {
    let old_drop_ins: &[DropIn] = old.map(|u| u.drop_ins.as_slice()).unwrap_or_default();

    let changed = new
        .drop_ins
        .iter()
        .filter(|d| !old_drop_ins.contains(d))
        .cloned()
        .collect();

    let deleted = old_drop_ins
        .iter()
        .filter(|d| !new.drop_ins.iter().any(|n| n.name == d.name))
        .cloned()
        .collect();

    DropInChanges { changed, deleted }
}

fn diff_containerd(previous: Option<&CriConfig>, desired: Option<&CriConfig>) -> ContainerdChanges {
    let old_registries = registries(previous);
    let new_registries = registries(desired);

    let changed = new_registries
        .iter()
        .filter(|r| !old_registries.contains(r))
        .cloned()
        .collect();

    let deleted = old_registries
        .iter()
        .filter(|r| !new_registries.iter().any(|n| n.upstream == r.upstream))
        .cloned()
        .collect();

    ContainerdChanges {
        config_file_changed: without_registries(previous) != without_registries(desired),
        registries: RegistryChanges { changed, deleted },
    }
}

fn registries(cri: Option<&CriConfig>) -> &[RegistryConfig] {
    cri.and_then(|c| c.containerd.as_ref())
        .map(|c| c.registries.as_slice())
        .unwrap_or_default()
}

fn without_registries(cri: Option<&CriConfig>) -> Option<CriConfig> {
    cri.map(|c| {
        let mut c = c.clone();
        if let Some(containerd) = c.containerd.as_mut() {
            containerd.registries.clear();
        }
        c
    })
}

fn file_differs(previous: &MergedConfig, desired: &MergedConfig, path: &str) -> bool {
    previous.file(path).map(|f| &f.content) != desired.file(path).map(|f| &f.content)
}

fn rotation_changed<F>(old: &InPlaceUpdates, new: &InPlaceUpdates, select: F) -> bool
where
    F: Fn(&CredentialsRotation) -> Option<&RotationStatus>,
{
    let old = old.credentials_rotation.as_ref().and_then(&select);
    let new = new.credentials_rotation.as_ref().and_then(&select);
    new.is_some() && old != new
}

/// `v1.31.2` -> `1.31`. Unparsable versions compare verbatim.
fn minor_version(version: &str) -> String {
    let trimmed = version.trim().trim_start_matches('v');
    let mut parts = trimmed.split('.');
    match (parts.next(), parts.next()) {
        (Some(major), Some(minor)) => format!("{major}.{minor}"),
        _ => trimmed.to_string(),
    }
}
