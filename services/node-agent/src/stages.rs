//! The named stages of a reconciliation pass.

use std::fmt;

/// One step of a pass. Stages run in the order of [`Stage::ALL`]; stages
/// that do not apply to a pass are skipped, never reordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Stage {
    LoadConfig,
    FetchNode,
    CheckInPlacePreconditions,
    UpdateOperatingSystem,
    ApplyContainerdConfig,
    ApplyInlineFiles,
    ApplyContainerdRegistries,
    ApplyImageRefFiles,
    ApplyChangedUnits,
    RemoveDeletedUnits,
    ReloadDaemon,
    StartContainerd,
    ExecuteUnitCommands,
    RebootstrapKubelet,
    WaitForKubelet,
    WaitForRegistries,
    RemoveDeletedFiles,
    EvictPods,
    PersistBaseline,
    RestartSelf,
    RemoveBootstrapFiles,
    AnnotateNode,
}

impl Stage {
    pub const ALL: [Stage; 22] = [
        Stage::LoadConfig,
        Stage::FetchNode,
        Stage::CheckInPlacePreconditions,
        Stage::UpdateOperatingSystem,
        Stage::ApplyContainerdConfig,
        Stage::ApplyInlineFiles,
        Stage::ApplyContainerdRegistries,
        Stage::ApplyImageRefFiles,
        Stage::ApplyChangedUnits,
        Stage::RemoveDeletedUnits,
        Stage::ReloadDaemon,
        Stage::StartContainerd,
        Stage::ExecuteUnitCommands,
        Stage::RebootstrapKubelet,
        Stage::WaitForKubelet,
        Stage::WaitForRegistries,
        Stage::RemoveDeletedFiles,
        Stage::EvictPods,
        Stage::PersistBaseline,
        Stage::RestartSelf,
        Stage::RemoveBootstrapFiles,
        Stage::AnnotateNode,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadConfig => "load-config",
            Self::FetchNode => "fetch-node",
            Self::CheckInPlacePreconditions => "check-in-place-preconditions",
            Self::UpdateOperatingSystem => "update-operating-system",
            Self::ApplyContainerdConfig => "apply-containerd-config",
            Self::ApplyInlineFiles => "apply-inline-files",
            Self::ApplyContainerdRegistries => "apply-containerd-registries",
            Self::ApplyImageRefFiles => "apply-image-ref-files",
            Self::ApplyChangedUnits => "apply-changed-units",
            Self::RemoveDeletedUnits => "remove-deleted-units",
            Self::ReloadDaemon => "reload-daemon",
            Self::StartContainerd => "start-containerd",
            Self::ExecuteUnitCommands => "execute-unit-commands",
            Self::RebootstrapKubelet => "rebootstrap-kubelet",
            Self::WaitForKubelet => "wait-for-kubelet",
            Self::WaitForRegistries => "wait-for-registries",
            Self::RemoveDeletedFiles => "remove-deleted-files",
            Self::EvictPods => "evict-pods",
            Self::PersistBaseline => "persist-baseline",
            Self::RestartSelf => "restart-self",
            Self::RemoveBootstrapFiles => "remove-bootstrap-files",
            Self::AnnotateNode => "annotate-node",
        }
    }

    /// Position in [`Stage::ALL`].
    pub fn position(&self) -> usize {
        *self as usize
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
