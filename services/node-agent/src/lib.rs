//! Gardener Node Agent Library
//!
//! The node agent runs on every worker machine and converges it to the
//! OperatingSystemConfig of its worker pool: files, systemd units, the
//! containerd configuration and registry mirrors, in-place OS and kubelet
//! updates.
//!
//! ## Architecture
//!
//! ```text
//! Reconciler            (loop: sync period, polling, backoff)
//! └── Controller        (one pass: Stage::ALL in order)
//!     ├── Applier               (files, units, unit commands)
//!     ├── ContainerdReconciler  (config.toml, hosts.toml, probes)
//!     └── kubelet               (health, rebootstrap)
//! ```
//!
//! Every side effect goes through a capability trait ([`fs::FileSystem`],
//! [`systemd::SystemdControl`], [`node::NodeApi`], ...). The [`testing`]
//! module has in-memory implementations of all of them.
//!
//! ## Modules
//!
//! - `applier`: file and unit changes
//! - `containerd`: containerd config and registry mirrors
//! - `controller`: a single reconciliation pass
//! - `image`: reading files out of OCI images
//! - `reconciler`: the reconciliation loop

pub mod applier;
pub mod baseline;
pub mod config;
pub mod containerd;
pub mod controller;
pub mod error;
pub mod fs;
pub mod image;
pub mod kube;
pub mod kubelet;
pub mod node;
pub mod osrelease;
pub mod osupdate;
pub mod paths;
pub mod reconciler;
pub mod signals;
pub mod source;
pub mod stages;
pub mod systemd;
pub mod testing;

pub use controller::{Capabilities, Controller, ControllerSettings, PassReport};
pub use error::{PassError, StageError};
pub use reconciler::{ExitReason, Reconciler, ReconcilerConfig};
pub use stages::Stage;
