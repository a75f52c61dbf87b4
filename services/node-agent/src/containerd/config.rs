//! `/etc/containerd/config.toml` enforcement.

use std::path::Path;

use gardener_osc::{CgroupDriver, CriConfig, PluginOperation};
use toml::{Table, Value};
use tracing::{debug, info};

use super::{ContainerdError, ContainerdReconciler};
use crate::fs::{write_if_changed, DEFAULT_DIR_PERMISSIONS};
use crate::paths::NodePaths;

const CRI_PLUGIN: &str = "io.containerd.grpc.v1.cri";
const CONFIG_VERSION: i64 = 2;
const CONFIG_FILE_PERMISSIONS: u32 = 0o644;

impl ContainerdReconciler {
    /// Enforce the agent-owned keys of the containerd config.
    ///
    /// Returns whether the file was rewritten.
    pub async fn apply_config(&self, tmp_dir: &Path, cri: Option<&CriConfig>) -> Result<bool, ContainerdError> {
        let Some(cri) = cri else {
            debug!("No CRI configured, leaving containerd alone");
            return Ok(false);
        };

        let fs = self.fs.as_ref();
        fs.create_dir_all(&self.paths.containerd_imports_dir, DEFAULT_DIR_PERMISSIONS)
            .await?;
        fs.create_dir_all(&self.paths.containerd_certs_dir, DEFAULT_DIR_PERMISSIONS)
            .await?;

        let path = &self.paths.containerd_config;
        let existing = fs
            .read(path)
            .await?
            .map(|raw| String::from_utf8_lossy(&raw).into_owned());
        let rendered = render_config(existing.as_deref(), cri, &self.paths)?;

        let written = write_if_changed(fs, tmp_dir, path, rendered.as_bytes(), CONFIG_FILE_PERMISSIONS).await?;
        info!(path = %path.display(), written, "Reconciled containerd config");
        Ok(written)
    }
}

/// Render the config file from its current content and the CRI settings.
pub fn render_config(existing: Option<&str>, cri: &CriConfig, paths: &NodePaths) -> Result<String, ContainerdError> {
    let mut root: Table = match existing {
        Some(content) if !content.trim().is_empty() => {
            toml::from_str(content).map_err(|source| ContainerdError::Parse {
                path: paths.containerd_config.clone(),
                source,
            })?
        }
        _ => Table::new(),
    };

    root.insert("version".to_string(), Value::Integer(CONFIG_VERSION));

    let import = format!("{}/*.toml", paths.containerd_imports_dir.display());
    let imports = root
        .entry("imports")
        .or_insert_with(|| Value::Array(Vec::new()));
    let Value::Array(imports) = imports else {
        return Err(invalid("imports", "not an array"));
    };
    if !imports.iter().any(|v| v.as_str() == Some(import.as_str())) {
        imports.push(Value::String(import));
    }

    let registry = table_at(&mut root, &["plugins", CRI_PLUGIN, "registry"])?;
    registry.insert(
        "config_path".to_string(),
        Value::String(paths.containerd_certs_dir.display().to_string()),
    );

    let containerd = cri.containerd.as_ref();
    if let Some(sandbox_image) = containerd.and_then(|c| c.sandbox_image.as_ref()) {
        table_at(&mut root, &["plugins", CRI_PLUGIN])?
            .insert("sandbox_image".to_string(), Value::String(sandbox_image.clone()));
    }

    if let Some(driver) = cri.cgroup_driver {
        let options = table_at(
            &mut root,
            &["plugins", CRI_PLUGIN, "containerd", "runtimes", "runc", "options"],
        )?;
        options.insert(
            "SystemdCgroup".to_string(),
            Value::Boolean(driver == CgroupDriver::Systemd),
        );
    }

    for plugin in containerd.map(|c| c.plugins.as_slice()).unwrap_or_default() {
        let keys: Vec<&str> = std::iter::once("plugins")
            .chain(plugin.path.iter().map(String::as_str))
            .collect();
        let key = keys.join(".");
        if plugin.path.is_empty() {
            return Err(invalid(&key, "empty plugin path"));
        }

        match plugin.op.unwrap_or_default() {
            PluginOperation::Add => {
                let table = table_at(&mut root, &keys)?;
                if let Some(values) = &plugin.values {
                    let values: Table = serde_json::from_value(values.clone())
                        .map_err(|e| invalid(&key, &e.to_string()))?;
                    merge_tables(table, values);
                }
            }
            PluginOperation::Remove => {
                if let Some((last, parents)) = keys.split_last() {
                    if let Some(parent) = existing_table_at(&mut root, parents) {
                        parent.remove(*last);
                    }
                }
            }
        }
    }

    Ok(toml::to_string(&root)?)
}

fn invalid(key: &str, reason: &str) -> ContainerdError {
    ContainerdError::InvalidConfig {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

/// The table at `keys`, creating missing tables on the way.
fn table_at<'a>(mut table: &'a mut Table, keys: &[&str]) -> Result<&'a mut Table, ContainerdError> {
    for (i, key) in keys.iter().enumerate() {
        table = match table
            .entry(*key)
            .or_insert_with(|| Value::Table(Table::new()))
        {
            Value::Table(inner) => inner,
            _ => return Err(invalid(&keys[..=i].join("."), "not a table")),
        };
    }
    Ok(table)
}

fn existing_table_at<'a>(mut table: &'a mut Table, keys: &[&str]) -> Option<&'a mut Table> {
    for key in keys {
        table = table.get_mut(*key)?.as_table_mut()?;
    }
    Some(table)
}

/// Deep-merge `src` into `dst`; scalars and arrays of `src` win.
fn merge_tables(dst: &mut Table, src: Table) {
    for (key, value) in src {
        match value {
            Value::Table(incoming) => match dst.get_mut(&key) {
                Some(Value::Table(existing)) => merge_tables(existing, incoming),
                _ => {
                    dst.insert(key, Value::Table(incoming));
                }
            },
            value => {
                dst.insert(key, value);
            }
        }
    }
}
