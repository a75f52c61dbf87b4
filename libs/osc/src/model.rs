//! Serde model of the OperatingSystemConfig document.
//!
//! Field names follow the upstream resource (camelCase). Unknown fields such
//! as `apiVersion`, `kind` or `metadata` are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::constants::DEFAULT_FILE_PERMISSIONS;

/// Desired state of a node's files and units.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfig {
    #[serde(default)]
    pub spec: OperatingSystemConfigSpec,

    #[serde(default)]
    pub status: OperatingSystemConfigStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfigSpec {
    #[serde(default)]
    pub files: Vec<File>,

    #[serde(default)]
    pub units: Vec<Unit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cri_config: Option<CriConfig>,

    /// Present only for worker pools that are updated in place.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place_updates: Option<InPlaceUpdates>,
}

/// Files and units contributed by extensions, appended to the spec lists.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystemConfigStatus {
    #[serde(default)]
    pub extension_files: Vec<File>,

    #[serde(default)]
    pub extension_units: Vec<Unit>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub in_place_update_config: Option<InPlaceUpdateConfig>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdateConfig {
    /// Script invoked with the target OS version to update the OS.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_script_path: Option<String>,
}

/// A file on the node, keyed by its absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct File {
    pub path: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub permissions: Option<u32>,

    pub content: FileContent,
}

impl File {
    /// Permissions to apply, falling back to `0600`.
    pub fn mode(&self) -> u32 {
        self.permissions.unwrap_or(DEFAULT_FILE_PERMISSIONS)
    }
}

/// Content of a file. Exactly one of `inline` and `image_ref` is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<InlineContent>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<ImageRefContent>,

    /// Delivery hint for provisioning; has no effect on the written bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transmit_unencoded: Option<bool>,
}

/// Borrowed view of where a file's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentSource<'a> {
    Inline(&'a InlineContent),
    ImageRef(&'a ImageRefContent),
}

impl FileContent {
    /// Inline content with identity encoding.
    pub fn inline(data: impl Into<String>) -> Self {
        Self {
            inline: Some(InlineContent {
                encoding: String::new(),
                data: data.into(),
            }),
            ..Self::default()
        }
    }

    /// Content copied out of a container image.
    pub fn image_ref(image: impl Into<String>, file_path_in_image: impl Into<String>) -> Self {
        Self {
            image_ref: Some(ImageRefContent {
                image: image.into(),
                file_path_in_image: file_path_in_image.into(),
            }),
            ..Self::default()
        }
    }

    /// The content source, or `None` if the content is empty or ambiguous.
    pub fn source(&self) -> Option<ContentSource<'_>> {
        match (&self.inline, &self.image_ref) {
            (Some(inline), None) => Some(ContentSource::Inline(inline)),
            (None, Some(image_ref)) => Some(ContentSource::ImageRef(image_ref)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineContent {
    /// `""` for plain data, `b64`/`base64`, or `gzip+b64`.
    #[serde(default)]
    pub encoding: String,

    #[serde(default)]
    pub data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRefContent {
    pub image: String,
    pub file_path_in_image: String,
}

/// A systemd unit, keyed by its name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Unit {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<UnitCommand>,

    /// Unit file content. Units without content only carry drop-ins.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub drop_ins: Vec<DropIn>,

    /// Files this unit depends on; a change to any of them restarts the unit.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub file_paths: Vec<String>,
}

impl Unit {
    /// Units are enabled unless explicitly disabled.
    pub fn is_enabled(&self) -> bool {
        self.enable.unwrap_or(true)
    }

    /// Whether a change to this unit should stop it instead of restarting it.
    pub fn wants_stop(&self) -> bool {
        !self.is_enabled() || self.command == Some(UnitCommand::Stop)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitCommand {
    Start,
    Restart,
    Stop,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DropIn {
    pub name: String,
    pub content: String,
}

/// Metadata for in-place updatable worker pools.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InPlaceUpdates {
    pub operating_system_version: String,

    pub kubelet_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_rotation: Option<CredentialsRotation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialsRotation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_authorities: Option<RotationStatus>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_key: Option<RotationStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStatus {
    pub last_initiation_time: DateTime<Utc>,
}

/// Container runtime settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CriConfig {
    pub name: CriName,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cgroup_driver: Option<CgroupDriver>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub containerd: Option<ContainerdConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CriName {
    Containerd,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CgroupDriver {
    Systemd,
    Cgroupfs,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerdConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sandbox_image: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub registries: Vec<RegistryConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plugins: Vec<PluginConfig>,
}

/// Mirror configuration for one upstream registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfig {
    /// Upstream host, e.g. `docker.io` or `localhost:5000`.
    pub upstream: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<RegistryHost>,

    /// Wait until every host answers before the pass completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readiness_probe: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryHost {
    pub url: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ca_certs: Vec<String>,
}

/// A patch applied to the `plugins` table of the containerd config.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
    /// Key path below `plugins`, e.g. `["io.containerd.grpc.v1.cri", "containerd"]`.
    pub path: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub op: Option<PluginOperation>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PluginOperation {
    #[default]
    Add,
    Remove,
}

#[cfg(test)]
mod tests {
    use super::*;

    const OSC_YAML: &str = r##"
apiVersion: extensions.gardener.cloud/v1alpha1
kind: OperatingSystemConfig
metadata:
  name: worker-a
spec:
  files:
  - path: /example/file
    permissions: 511
    content:
      inline:
        encoding: ""
        data: file1
  - path: /third/file
    content:
      imageRef:
        image: foo-image
        filePathInImage: /foo-file
  units:
  - name: unit1
    enable: true
    command: start
    content: "#unit1"
    dropIns:
    - name: drop
      content: "#unit1drop"
  criConfig:
    name: containerd
    cgroupDriver: systemd
    containerd:
      sandboxImage: registry.k8s.io/pause:3.9
      registries:
      - upstream: docker.io
        hosts:
        - url: https://mirror.example.com
  inPlaceUpdates:
    operatingSystemVersion: "1.2"
    kubeletVersion: v1.31.1
status:
  extensionUnits:
  - name: unit3
    filePaths: [/example/file]
  inPlaceUpdateConfig:
    updateScriptPath: /opt/bin/update.sh
"##;

    #[test]
    fn test_decode_full_document() {
        let osc: OperatingSystemConfig = serde_yaml::from_str(OSC_YAML).unwrap();

        assert_eq!(osc.spec.files.len(), 2);
        assert_eq!(osc.spec.files[0].mode(), 0o777);
        assert_eq!(osc.spec.files[1].mode(), 0o600);
        assert!(matches!(
            osc.spec.files[1].content.source(),
            Some(ContentSource::ImageRef(r)) if r.file_path_in_image == "/foo-file"
        ));

        let unit = &osc.spec.units[0];
        assert_eq!(unit.command, Some(UnitCommand::Start));
        assert_eq!(unit.drop_ins[0].content, "#unit1drop");
        assert!(unit.is_enabled());

        let cri = osc.spec.cri_config.as_ref().unwrap();
        assert_eq!(cri.cgroup_driver, Some(CgroupDriver::Systemd));
        assert_eq!(cri.containerd.as_ref().unwrap().registries[0].upstream, "docker.io");

        assert_eq!(
            osc.spec.in_place_updates.as_ref().unwrap().kubelet_version,
            "v1.31.1"
        );
        assert_eq!(osc.status.extension_units[0].file_paths, vec!["/example/file"]);
        assert_eq!(
            osc.status
                .in_place_update_config
                .as_ref()
                .and_then(|c| c.update_script_path.as_deref()),
            Some("/opt/bin/update.sh")
        );
    }

    #[test]
    fn test_ambiguous_content_has_no_source() {
        let mut content = FileContent::inline("x");
        content.image_ref = FileContent::image_ref("img", "/p").image_ref;
        assert_eq!(content.source(), None);
        assert_eq!(FileContent::default().source(), None);
    }

    #[test]
    fn test_unit_stop_semantics() {
        let mut unit = Unit {
            name: "u".to_string(),
            ..Unit::default()
        };
        assert!(!unit.wants_stop());

        unit.command = Some(UnitCommand::Stop);
        assert!(unit.wants_stop());

        unit.command = Some(UnitCommand::Start);
        unit.enable = Some(false);
        assert!(unit.wants_stop());
    }
}
