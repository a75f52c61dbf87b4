//! Integration tests for the reconciliation flow.
//!
//! These tests drive full passes of the controller against the in-memory
//! capabilities:
//! 1. Config is loaded and diffed against the persisted baseline
//! 2. Files, units and containerd are converged
//! 3. The node is annotated with the applied checksum

use std::path::{Path, PathBuf};

use gardener_node_agent::controller::{Controller, ControllerSettings, PassReport};
use gardener_node_agent::fs::FileSystem;
use gardener_node_agent::node::{
    Node, PodRef, ANNOTATION_CHECKSUM_APPLIED, ANNOTATION_UPDATING_OS_VERSION, LABEL_HOSTNAME,
    LABEL_KUBERNETES_VERSION, LABEL_MACHINE_READY_FOR_UPDATE, LABEL_MACHINE_UPDATE_SUCCESSFUL,
};
use gardener_node_agent::paths::NodePaths;
use gardener_node_agent::stages::Stage;
use gardener_node_agent::systemd::UnitOperation;
use gardener_node_agent::testing::FakeCapabilities;
use gardener_reconcile::{Checksum, Outcome, DEFAULT_REQUEUE_DELAY};
use tokio::sync::watch;

const NODE: &str = "worker-1";
const BASELINE: &str = "/var/lib/gardener-node-agent/last-applied-osc.yaml";
const OS_RELEASE: &str = "/etc/os-release";

struct Harness {
    fakes: FakeCapabilities,
    controller: Controller,
    shutdown: watch::Receiver<bool>,
}

impl Harness {
    /// Registered node, addressed by name.
    fn new() -> Self {
        let harness = Self::with_settings(ControllerSettings {
            node_name: Some(NODE.to_string()),
            ..ControllerSettings::default()
        });
        harness.fakes.node_api.insert_node(Node::new(NODE));
        harness
    }

    fn with_settings(settings: ControllerSettings) -> Self {
        let fakes = FakeCapabilities::new();
        let (tx, rx) = watch::channel(false);
        let controller = Controller::new(
            fakes.capabilities(),
            NodePaths::default(),
            settings,
            reqwest::Client::new(),
            tx,
        );
        Self {
            fakes,
            controller,
            shutdown: rx,
        }
    }

    fn seed_baseline(&self, raw: &str) {
        self.fakes.fs.insert_file(BASELINE, raw.as_bytes(), 0o644);
    }

    fn desire(&self, raw: &str) {
        self.fakes.source.set(raw);
    }

    async fn pass(&mut self) -> PassReport {
        self.controller.reconcile().await.expect("pass failed")
    }

    fn node(&self) -> Node {
        self.fakes.node_api.node(NODE).expect("node registered")
    }

    fn checksum_annotation(&self) -> Option<String> {
        self.node().annotation(ANNOTATION_CHECKSUM_APPLIED).map(str::to_string)
    }
}

fn assert_stage_order(report: &PassReport) {
    assert!(
        report.stages.windows(2).all(|w| w[0] < w[1]),
        "stages out of order: {:?}",
        report.stages
    );
}

#[tokio::test]
async fn test_changed_file_content_is_overwritten() {
    let mut h = Harness::new();
    h.seed_baseline(
        r#"
spec:
  files:
  - path: /a
    permissions: 420
    content:
      inline:
        data: "x"
"#,
    );
    h.fakes.fs.insert_file("/a", b"x", 0o644);
    let desired = r#"
spec:
  files:
  - path: /a
    permissions: 420
    content:
      inline:
        data: "y"
"#;
    h.desire(desired);

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(h.fakes.fs.file("/a").as_deref(), Some(&b"y"[..]));
    assert_eq!(h.fakes.fs.mode("/a"), Some(0o644));
    assert_eq!(h.fakes.fs.file(BASELINE).as_deref(), Some(desired.as_bytes()));
    assert_eq!(
        h.checksum_annotation().as_deref(),
        Some(Checksum::of(desired.as_bytes()).as_str())
    );
    assert_stage_order(&report);
}

#[tokio::test]
async fn test_deleted_unit_is_disabled_stopped_and_removed() {
    let mut h = Harness::new();
    h.seed_baseline(
        r#"
spec:
  files:
  - path: /etc/u1.conf
    content:
      inline:
        data: old
  units:
  - name: u1.service
    enable: true
    content: A
"#,
    );
    h.fakes.fs.insert_file("/etc/systemd/system/u1.service", b"A", 0o644);
    h.fakes.fs.insert_file("/etc/u1.conf", b"old", 0o600);
    h.desire("spec: {}\n");

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(
        h.fakes.systemd.operations_on("u1.service"),
        vec![UnitOperation::Disable, UnitOperation::Stop]
    );
    assert!(h.fakes.fs.file("/etc/systemd/system/u1.service").is_none());
    assert!(h.fakes.fs.file("/etc/u1.conf").is_none());
    assert!(report.ran(Stage::RemoveDeletedUnits));
    assert!(report.ran(Stage::RemoveDeletedFiles));
}

#[tokio::test]
async fn test_disabled_unit_with_changed_dependency_is_stopped() {
    let mut h = Harness::new();
    let config = |data: &str| {
        format!(
            r#"
spec:
  files:
  - path: /etc/u2.conf
    content:
      inline:
        data: {data}
  units:
  - name: u2.service
    enable: false
    content: B
    filePaths:
    - /etc/u2.conf
"#
        )
    };
    h.seed_baseline(&config("old"));
    h.fakes.fs.insert_file("/etc/u2.conf", b"old", 0o600);
    h.fakes.fs.insert_file("/etc/systemd/system/u2.service", b"B", 0o600);
    h.desire(&config("new"));

    h.pass().await;

    assert_eq!(
        h.fakes.systemd.operations_on("u2.service"),
        vec![UnitOperation::Disable, UnitOperation::Stop]
    );
    assert_eq!(h.fakes.fs.file("/etc/u2.conf").as_deref(), Some(&b"new"[..]));
}

#[tokio::test]
async fn test_os_update_waits_for_ready_label() {
    let mut h = Harness::new();
    let config = |version: &str| {
        format!(
            r#"
spec:
  files:
  - path: /etc/motd
    content:
      inline:
        data: "{version}"
  inPlaceUpdates:
    operatingSystemVersion: "{version}"
    kubeletVersion: v1.31.1
status:
  inPlaceUpdateConfig:
    updateScriptPath: /opt/bin/update-os.sh
"#
        )
    };
    h.seed_baseline(&config("1.0"));
    h.fakes.fs.insert_file(OS_RELEASE, b"PRETTY_NAME=\"Garden Linux 1.0\"\n", 0o644);
    h.desire(&config("2.0"));

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::RequeueAfter(DEFAULT_REQUEUE_DELAY));
    assert_eq!(
        report.stages,
        vec![Stage::LoadConfig, Stage::FetchNode, Stage::CheckInPlacePreconditions]
    );
    assert_eq!(h.fakes.fs.write_count(), 0);
    assert!(h.fakes.systemd.calls().is_empty());
    assert!(h.fakes.os_update.calls().is_empty());
    assert!(h.checksum_annotation().is_none());
}

#[tokio::test]
async fn test_independent_units_are_both_restarted() {
    let mut h = Harness::new();
    h.desire(
        r#"
spec:
  units:
  - name: u3.service
    content: C
  - name: u4.service
    content: D
"#,
    );

    let report = h.pass().await;

    for unit in ["u3.service", "u4.service"] {
        assert_eq!(
            h.fakes.systemd.operations_on(unit),
            vec![UnitOperation::Enable, UnitOperation::Restart]
        );
    }

    // both restarts are done before the checksum is written
    let calls = h.fakes.systemd.calls();
    let reload = calls
        .iter()
        .position(|c| *c == (UnitOperation::DaemonReload, String::new()))
        .unwrap();
    let containerd = calls
        .iter()
        .position(|c| *c == (UnitOperation::Start, "containerd.service".to_string()))
        .unwrap();
    assert!(reload < containerd);
    assert_eq!(calls.len(), 6);
    assert!(h.checksum_annotation().is_some());
    assert_stage_order(&report);
}

#[tokio::test]
async fn test_extension_files_and_units_are_merged() {
    let mut h = Harness::new();
    h.fakes
        .images
        .insert("registry.example.com/tools:v1", "/bin/helper", b"#!/bin/sh\n");
    h.desire(
        r#"
spec:
  files:
  - path: /etc/base.conf
    content:
      inline:
        encoding: b64
        data: YmFzZQ==
status:
  extensionFiles:
  - path: /opt/bin/helper
    permissions: 493
    content:
      imageRef:
        image: registry.example.com/tools:v1
        filePathInImage: /bin/helper
  extensionUnits:
  - name: ext.service
    content: E
    dropIns:
    - name: 10-env.conf
      content: "[Service]\nEnvironment=A=1\n"
"#,
    );

    h.pass().await;

    assert_eq!(h.fakes.fs.file("/etc/base.conf").as_deref(), Some(&b"base"[..]));
    assert_eq!(h.fakes.fs.file("/opt/bin/helper").as_deref(), Some(&b"#!/bin/sh\n"[..]));
    assert_eq!(h.fakes.fs.mode("/opt/bin/helper"), Some(0o755));
    assert_eq!(h.fakes.images.copies(), 1);
    assert_eq!(
        h.fakes.fs.file("/etc/systemd/system/ext.service.d/10-env.conf").as_deref(),
        Some(&b"[Service]\nEnvironment=A=1\n"[..])
    );
    assert_eq!(
        h.fakes.systemd.operations_on("ext.service"),
        vec![UnitOperation::Enable, UnitOperation::Restart]
    );
}

#[tokio::test]
async fn test_own_unit_change_restarts_agent_before_annotating() {
    let mut h = Harness::new();
    h.desire(
        r#"
spec:
  units:
  - name: gardener-node-agent.service
    content: "[Service]\nExecStart=/opt/bin/gardener-node-agent\n"
  - name: other.service
    content: O
"#,
    );

    let report = h.pass().await;

    assert!(report.restart_self);
    assert!(report.ran(Stage::PersistBaseline));
    assert!(report.ran(Stage::RestartSelf));
    assert!(!report.ran(Stage::AnnotateNode));
    assert!(*h.shutdown.borrow());
    assert!(h.fakes.fs.file(BASELINE).is_some());
    assert!(h.checksum_annotation().is_none());

    // the agent's unit is enabled but never restarted by itself
    assert_eq!(
        h.fakes.systemd.operations_on("gardener-node-agent.service"),
        vec![UnitOperation::Enable]
    );
    assert_eq!(
        h.fakes.systemd.operations_on("other.service"),
        vec![UnitOperation::Enable, UnitOperation::Restart]
    );
}

#[tokio::test]
async fn test_unregistered_node_is_requeued_after_applying() {
    let mut h = Harness::with_settings(ControllerSettings {
        node_name: Some(NODE.to_string()),
        ..ControllerSettings::default()
    });
    h.desire(
        r#"
spec:
  files:
  - path: /etc/a
    content:
      inline:
        data: a
"#,
    );

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::RequeueAfter(DEFAULT_REQUEUE_DELAY));
    assert!(report.ran(Stage::PersistBaseline));
    assert!(!report.ran(Stage::AnnotateNode));
    assert!(h.fakes.fs.file("/etc/a").is_some());
    assert!(h.fakes.node_api.patches().is_empty());
    assert!(h.controller.last_applied().is_none());
}

#[tokio::test]
async fn test_node_is_found_by_hostname() {
    let mut h = Harness::with_settings(ControllerSettings {
        hostname: "ip-10-0-0-1".to_string(),
        kubernetes_version: Some("1.31.1".to_string()),
        ..ControllerSettings::default()
    });
    let mut node = Node::new("shoot--dev--worker-z1-abc");
    node.labels.insert(LABEL_HOSTNAME.to_string(), "ip-10-0-0-1".to_string());
    h.fakes.node_api.insert_node(node);
    h.desire("spec: {}\n");

    h.pass().await;

    assert_eq!(h.controller.node_name(), Some("shoot--dev--worker-z1-abc"));
    let node = h.fakes.node_api.node("shoot--dev--worker-z1-abc").unwrap();
    assert!(node.annotation(ANNOTATION_CHECKSUM_APPLIED).is_some());
    assert_eq!(node.label(LABEL_KUBERNETES_VERSION), Some("1.31.1"));
}

#[tokio::test]
async fn test_failed_pass_leaves_checksum_and_baseline_untouched() {
    let mut h = Harness::new();
    h.fakes.systemd.fail_on(UnitOperation::Restart, "u3.service");
    h.desire(
        r#"
spec:
  units:
  - name: u3.service
    content: C
  - name: u4.service
    content: D
"#,
    );

    let err = h.controller.reconcile().await.unwrap_err();

    assert_eq!(err.stage, Stage::ExecuteUnitCommands);
    // the other unit was still restarted
    assert!(h
        .fakes
        .systemd
        .operations_on("u4.service")
        .contains(&UnitOperation::Restart));
    assert!(h.fakes.fs.file(BASELINE).is_none());
    assert!(h.checksum_annotation().is_none());
    assert!(h.controller.last_applied().is_none());
    // temporary directories are cleaned up either way
    assert!(h.fakes.fs.files_under("/var/lib/gardener-node-agent/tmp").is_empty());
}

#[tokio::test]
async fn test_converged_node_is_left_alone() {
    let mut h = Harness::new();
    h.desire(
        r#"
spec:
  units:
  - name: u3.service
    content: C
"#,
    );
    h.pass().await;
    h.fakes.systemd.clear();

    let report = h.pass().await;

    assert_eq!(report.stages, vec![Stage::LoadConfig, Stage::FetchNode]);
    assert_eq!(report.outcome, Outcome::Done);
    assert!(h.fakes.systemd.calls().is_empty());
}

#[tokio::test]
async fn test_second_pass_without_changes_runs_no_unit_operations() {
    let mut h = Harness::new();
    h.desire(
        r#"
spec:
  files:
  - path: /etc/a
    content:
      inline:
        data: a
  units:
  - name: u3.service
    content: C
    filePaths:
    - /etc/a
  criConfig:
    name: containerd
    containerd:
      sandboxImage: registry.k8s.io/pause:3.10
"#,
    );
    let first = h.pass().await;
    assert!(first.ran(Stage::ApplyContainerdConfig));
    let containerd_config = h.fakes.fs.file("/etc/containerd/config.toml");
    assert!(containerd_config.is_some());

    // node object recreated without the checksum annotation
    h.fakes.node_api.insert_node(Node::new(NODE));
    h.fakes.systemd.clear();
    let writes = h.fakes.fs.write_count();

    let second = h.pass().await;

    assert!(h.fakes.systemd.calls().is_empty());
    assert_eq!(h.fakes.fs.write_count(), writes);
    // enforced again, but the rendered bytes are identical
    assert!(second.ran(Stage::ApplyContainerdConfig));
    assert!(!second.ran(Stage::ReloadDaemon));
    assert!(second.ran(Stage::AnnotateNode));
    assert_eq!(h.fakes.fs.file("/etc/containerd/config.toml"), containerd_config);
    assert!(h.checksum_annotation().is_some());
}

#[tokio::test]
async fn test_containerd_config_drift_is_repaired() {
    let mut h = Harness::new();
    let config = |data: &str| {
        format!(
            r#"
spec:
  files:
  - path: /etc/a
    content:
      inline:
        data: "{data}"
  criConfig:
    name: containerd
    cgroupDriver: systemd
"#
        )
    };
    h.desire(&config("a"));
    h.pass().await;
    let containerd_config = h.fakes.fs.file("/etc/containerd/config.toml");
    assert!(containerd_config.is_some());

    h.fakes
        .fs
        .remove_file(Path::new("/etc/containerd/config.toml"))
        .await
        .unwrap();
    h.fakes.systemd.clear();
    h.desire(&config("b"));

    let report = h.pass().await;

    assert!(report.ran(Stage::ApplyContainerdConfig));
    assert_eq!(h.fakes.fs.file("/etc/containerd/config.toml"), containerd_config);
    assert_eq!(
        h.fakes.systemd.operations_on("containerd.service"),
        vec![UnitOperation::Start, UnitOperation::Restart]
    );
}

#[tokio::test]
async fn test_in_place_update_with_own_unit_change_evicts_before_restart() {
    let mut h = Harness::new();
    let mut node = Node::new(NODE);
    node.labels.insert(LABEL_MACHINE_READY_FOR_UPDATE.to_string(), "true".to_string());
    h.fakes.node_api.insert_node(node);
    h.fakes.node_api.add_pod(NODE, PodRef::new("default", "web-0"));
    h.fakes.fs.insert_file(OS_RELEASE, b"PRETTY_NAME=\"Garden Linux 1.0\"\n", 0o644);
    h.desire(
        r#"
spec:
  units:
  - name: gardener-node-agent.service
    content: "[Service]\nExecStart=/opt/bin/gardener-node-agent\n"
  inPlaceUpdates:
    operatingSystemVersion: "2.0"
    kubeletVersion: v1.31.1
status:
  inPlaceUpdateConfig:
    updateScriptPath: /opt/bin/update-os.sh
"#,
    );

    let first = h.pass().await;

    assert!(first.restart_self);
    assert!(first.ran(Stage::EvictPods));
    assert!(first.ran(Stage::RestartSelf));
    assert_stage_order(&first);
    assert_eq!(h.fakes.node_api.deleted_pods(), vec![PodRef::new("default", "web-0")]);
    assert_eq!(h.node().label(LABEL_MACHINE_UPDATE_SUCCESSFUL), Some("true"));
    assert!(h.checksum_annotation().is_none());

    // the relaunched agent only finalises
    let (tx, _rx) = watch::channel(false);
    let mut relaunched = Controller::new(
        h.fakes.capabilities(),
        NodePaths::default(),
        ControllerSettings {
            node_name: Some(NODE.to_string()),
            ..ControllerSettings::default()
        },
        reqwest::Client::new(),
        tx,
    );
    let second = relaunched.reconcile().await.expect("pass failed");

    assert_eq!(second.outcome, Outcome::Done);
    assert!(!second.ran(Stage::UpdateOperatingSystem));
    assert!(!second.ran(Stage::EvictPods));
    assert!(second.ran(Stage::AnnotateNode));
    assert_eq!(h.fakes.os_update.calls().len(), 1);
    assert!(h.checksum_annotation().is_some());
}

#[tokio::test]
async fn test_in_place_os_update() {
    let mut h = Harness::new();
    let mut node = Node::new(NODE);
    node.labels.insert(LABEL_MACHINE_READY_FOR_UPDATE.to_string(), "true".to_string());
    h.fakes.node_api.insert_node(node);
    h.fakes.node_api.add_pod(NODE, PodRef::new("default", "web-0"));
    h.fakes.fs.insert_file(OS_RELEASE, b"PRETTY_NAME=\"Garden Linux 1.0\"\n", 0o644);
    h.desire(
        r#"
spec:
  inPlaceUpdates:
    operatingSystemVersion: "2.0"
    kubeletVersion: v1.31.1
status:
  inPlaceUpdateConfig:
    updateScriptPath: /opt/bin/update-os.sh
"#,
    );

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::Done);
    assert!(report.ran(Stage::UpdateOperatingSystem));
    assert!(report.ran(Stage::EvictPods));
    assert_stage_order(&report);
    assert_eq!(
        h.fakes.os_update.calls(),
        vec![(PathBuf::from("/opt/bin/update-os.sh"), "2.0".to_string())]
    );
    assert_eq!(h.fakes.node_api.deleted_pods(), vec![PodRef::new("default", "web-0")]);

    let node = h.node();
    assert_eq!(node.annotation(ANNOTATION_UPDATING_OS_VERSION), Some("2.0"));
    assert_eq!(node.label(LABEL_MACHINE_UPDATE_SUCCESSFUL), Some("true"));
    assert!(node.annotation(ANNOTATION_CHECKSUM_APPLIED).is_some());
}

#[tokio::test]
async fn test_failed_os_update_aborts_pass() {
    let mut h = Harness::new();
    let mut node = Node::new(NODE);
    node.labels.insert(LABEL_MACHINE_READY_FOR_UPDATE.to_string(), "true".to_string());
    h.fakes.node_api.insert_node(node);
    h.fakes.os_update.set_failing(true);
    h.desire(
        r#"
spec:
  files:
  - path: /etc/a
    content:
      inline:
        data: a
  inPlaceUpdates:
    operatingSystemVersion: "2.0"
    kubeletVersion: v1.31.1
status:
  inPlaceUpdateConfig:
    updateScriptPath: /opt/bin/update-os.sh
"#,
    );

    let err = h.controller.reconcile().await.unwrap_err();

    assert_eq!(err.stage, Stage::UpdateOperatingSystem);
    assert!(h.fakes.fs.file("/etc/a").is_none());
    assert!(h.checksum_annotation().is_none());
}

#[tokio::test]
async fn test_bootstrap_files_are_removed_once_registered() {
    let mut h = Harness::new();
    let paths = NodePaths::default();
    h.fakes.fs.insert_file(&paths.bootstrap_token, b"token", 0o600);
    h.fakes.fs.insert_file(paths.kubeconfig_bootstrap(), b"kubeconfig", 0o600);
    h.desire("spec: {}\n");

    let report = h.pass().await;

    assert!(report.ran(Stage::RemoveBootstrapFiles));
    assert!(h.fakes.fs.file(&paths.bootstrap_token).is_none());
    assert!(h.fakes.fs.file(paths.kubeconfig_bootstrap()).is_none());
}

#[tokio::test]
async fn test_unreadable_baseline_applies_everything() {
    let mut h = Harness::new();
    h.seed_baseline("spec: [not, a, mapping");
    h.fakes.fs.insert_file("/etc/a", b"a", 0o600);
    h.desire(
        r#"
spec:
  files:
  - path: /etc/a
    content:
      inline:
        data: a
"#,
    );

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::Done);
    assert!(h.fakes.fs.write_count() > 0);
    assert_eq!(h.fakes.fs.file("/etc/a").as_deref(), Some(&b"a"[..]));
}

#[tokio::test]
async fn test_no_config_yet() {
    let mut h = Harness::new();

    let report = h.pass().await;

    assert_eq!(report.outcome, Outcome::Done);
    assert_eq!(report.stages, vec![Stage::LoadConfig]);
    assert_eq!(h.fakes.fs.write_count(), 0);
}
