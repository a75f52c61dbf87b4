//! Merging of primary and extension files/units into one canonical set.
//!
//! All identity invariants are enforced here, so the diff engine can assume
//! unique paths and names.

use std::collections::{BTreeSet, HashMap};

use thiserror::Error;

use crate::model::{
    CriConfig, File, InPlaceUpdates, OperatingSystemConfig, Unit,
};

/// Violations of the OSC identity invariants.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("file path {0:?} is declared more than once")]
    DuplicateFilePath(String),

    #[error("file path {0:?} is not absolute")]
    RelativeFilePath(String),

    #[error("file {0:?} must set exactly one of inline and imageRef content")]
    InvalidFileContent(String),

    #[error("invalid unit name {0:?}")]
    InvalidUnitName(String),

    #[error("unit {unit:?} declares field {field} with conflicting values")]
    ConflictingUnit { unit: String, field: &'static str },

    #[error("unit {unit:?} declares drop-in {drop_in:?} more than once")]
    DuplicateDropIn { unit: String, drop_in: String },

    #[error("invalid drop-in name {drop_in:?} for unit {unit:?}")]
    InvalidDropInName { unit: String, drop_in: String },

    #[error("unit {unit:?} references file {path:?} which is not part of the configuration")]
    UnknownFilePath { unit: String, path: String },

    #[error("invalid registry upstream {0:?}")]
    InvalidRegistryUpstream(String),
}

/// The canonical, validated view of an OSC that the diff engine works on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MergedConfig {
    /// Files in declaration order (spec first, then extensions).
    pub files: Vec<File>,

    /// Units in order of first declaration.
    pub units: Vec<Unit>,

    pub cri_config: Option<CriConfig>,

    pub in_place_updates: Option<InPlaceUpdates>,

    pub update_script_path: Option<String>,
}

impl MergedConfig {
    /// Look up a file by path.
    pub fn file(&self, path: &str) -> Option<&File> {
        self.files.iter().find(|f| f.path == path)
    }

    /// Look up a unit by name.
    pub fn unit(&self, name: &str) -> Option<&Unit> {
        self.units.iter().find(|u| u.name == name)
    }

    /// Target OS version, if the pool is updated in place.
    pub fn os_version(&self) -> Option<&str> {
        self.in_place_updates
            .as_ref()
            .map(|u| u.operating_system_version.as_str())
    }
}

impl OperatingSystemConfig {
    /// Merge `spec` and `status` extension lists and validate the result.
    pub fn merged(&self) -> Result<MergedConfig, ValidationError> {
        let files = merge_files(
            self.spec
                .files
                .iter()
                .chain(self.status.extension_files.iter()),
        )?;
        let units = merge_units(
            self.spec
                .units
                .iter()
                .chain(self.status.extension_units.iter()),
        )?;

        let paths: BTreeSet<&str> = files.iter().map(|f| f.path.as_str()).collect();
        for unit in &units {
            if let Some(missing) = unit
                .file_paths
                .iter()
                .find(|p| !paths.contains(p.as_str()))
            {
                return Err(ValidationError::UnknownFilePath {
                    unit: unit.name.clone(),
                    path: missing.clone(),
                });
            }
        }

        // upstreams name directories below certs.d
        let registries = self
            .spec
            .cri_config
            .iter()
            .filter_map(|c| c.containerd.as_ref())
            .flat_map(|c| c.registries.iter());
        for registry in registries {
            if !is_valid_name(&registry.upstream) {
                return Err(ValidationError::InvalidRegistryUpstream(registry.upstream.clone()));
            }
        }

        Ok(MergedConfig {
            files,
            units,
            cri_config: self.spec.cri_config.clone(),
            in_place_updates: self.spec.in_place_updates.clone(),
            update_script_path: self
                .status
                .in_place_update_config
                .as_ref()
                .and_then(|c| c.update_script_path.clone()),
        })
    }
}

fn merge_files<'a>(files: impl Iterator<Item = &'a File>) -> Result<Vec<File>, ValidationError> {
    let mut seen = BTreeSet::new();
    let mut merged = Vec::new();

    for file in files {
        if !file.path.starts_with('/') {
            return Err(ValidationError::RelativeFilePath(file.path.clone()));
        }
        if file.content.source().is_none() {
            return Err(ValidationError::InvalidFileContent(file.path.clone()));
        }
        if !seen.insert(file.path.as_str()) {
            return Err(ValidationError::DuplicateFilePath(file.path.clone()));
        }
        merged.push(file.clone());
    }

    Ok(merged)
}

fn merge_units<'a>(units: impl Iterator<Item = &'a Unit>) -> Result<Vec<Unit>, ValidationError> {
    let mut index: HashMap<&str, usize> = HashMap::new();
    let mut merged: Vec<Unit> = Vec::new();

    for unit in units {
        if !is_valid_name(&unit.name) {
            return Err(ValidationError::InvalidUnitName(unit.name.clone()));
        }
        for drop_in in &unit.drop_ins {
            if !is_valid_name(&drop_in.name) {
                return Err(ValidationError::InvalidDropInName {
                    unit: unit.name.clone(),
                    drop_in: drop_in.name.clone(),
                });
            }
        }

        match index.get(unit.name.as_str()) {
            None => {
                index.insert(unit.name.as_str(), merged.len());
                let mut first = unit.clone();
                first.drop_ins.clear();
                first.file_paths.clear();
                fold_lists(&mut first, unit)?;
                merged.push(first);
            }
            Some(&i) => {
                let target = &mut merged[i];
                fill(&mut target.content, &unit.content, &unit.name, "content")?;
                fill(&mut target.enable, &unit.enable, &unit.name, "enable")?;
                fill(&mut target.command, &unit.command, &unit.name, "command")?;
                fold_lists(target, unit)?;
            }
        }
    }

    Ok(merged)
}

/// Take `source` if `target` is unset; equal values are fine, different ones conflict.
fn fill<T: Clone + PartialEq>(
    target: &mut Option<T>,
    source: &Option<T>,
    unit: &str,
    field: &'static str,
) -> Result<(), ValidationError> {
    match (target.as_ref(), source) {
        (_, None) => Ok(()),
        (None, Some(value)) => {
            *target = Some(value.clone());
            Ok(())
        }
        (Some(existing), Some(value)) if existing == value => Ok(()),
        (Some(_), Some(_)) => Err(ValidationError::ConflictingUnit {
            unit: unit.to_string(),
            field,
        }),
    }
}

fn fold_lists(target: &mut Unit, source: &Unit) -> Result<(), ValidationError> {
    for drop_in in &source.drop_ins {
        if target.drop_ins.iter().any(|d| d.name == drop_in.name) {
            return Err(ValidationError::DuplicateDropIn {
                unit: target.name.clone(),
                drop_in: drop_in.name.clone(),
            });
        }
        target.drop_ins.push(drop_in.clone());
    }

    for path in &source.file_paths {
        if !target.file_paths.contains(path) {
            target.file_paths.push(path.clone());
        }
    }

    Ok(())
}

/// Names end up as single path components, below `/etc/systemd/system` or
/// the containerd `certs.d` directory.
fn is_valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}
