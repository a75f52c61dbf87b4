//! OperatingSystemConfig model and diff engine.
//!
//! An OperatingSystemConfig (OSC) describes the files and systemd units a
//! node must carry. This crate knows how to:
//!
//! - decode the OSC document delivered to the node (YAML or JSON)
//! - merge the primary lists with the extension lists appended by third
//!   parties into one canonical set ([`MergedConfig`])
//! - compute the minimal change-set between the last applied configuration
//!   and the desired one ([`compute_changes`])
//!
//! It performs no I/O. Applying a change-set is the node agent's job.

pub mod constants;
mod content;
mod diff;
mod merge;
mod model;

pub use content::DecodeError;
pub use diff::{
    compute_changes, ChangedUnit, ContainerdChanges, DropInChanges, FileChanges, KubeletUpdate,
    OperatingSystemConfigChanges, OsVersionChange, RegistryChanges, UnitChanges,
};
pub use merge::{MergedConfig, ValidationError};
pub use model::{
    CgroupDriver, ContentSource, ContainerdConfig, CredentialsRotation, CriConfig, CriName, DropIn,
    File, FileContent, ImageRefContent, InPlaceUpdateConfig, InPlaceUpdates, InlineContent,
    OperatingSystemConfig, OperatingSystemConfigSpec, OperatingSystemConfigStatus, PluginConfig,
    PluginOperation, RegistryConfig, RegistryHost, RotationStatus, Unit, UnitCommand,
};

/// Errors from decoding an OSC document.
#[derive(Debug, thiserror::Error)]
pub enum OscError {
    #[error("unable to decode operating system config: {0}")]
    Decode(#[from] serde_yaml::Error),

    #[error("unable to encode operating system config: {0}")]
    Encode(#[source] serde_yaml::Error),

    #[error(transparent)]
    Invalid(#[from] ValidationError),
}

impl OperatingSystemConfig {
    /// Decode an OSC document. JSON is accepted as well since it is valid YAML.
    pub fn decode(raw: &[u8]) -> Result<Self, OscError> {
        Ok(serde_yaml::from_slice(raw)?)
    }

    /// Encode the OSC as YAML.
    pub fn encode(&self) -> Result<Vec<u8>, OscError> {
        serde_yaml::to_string(self)
            .map(String::into_bytes)
            .map_err(OscError::Encode)
    }

    /// Decode and merge in one step.
    pub fn decode_merged(raw: &[u8]) -> Result<MergedConfig, OscError> {
        Ok(Self::decode(raw)?.merged()?)
    }
}
