//! In-memory capability implementations for tests.
//!
//! Each fake records what was done to it so tests can assert on side
//! effects without touching the host.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::controller::Capabilities;
use crate::fs::{FileSystem, FsError, DEFAULT_DIR_PERMISSIONS};
use crate::image::{ExtractError, ImageError, ImageExtractor};
use crate::kubelet::KubeletHealth;
use crate::node::{ApiError, Node, NodeApi, NodePatch, PodRef, LABEL_HOSTNAME};
use crate::osupdate::{OsUpdateError, OsUpdateExecutor};
use crate::paths::NodePaths;
use crate::source::{ConfigBlob, ConfigSource, SourceError};
use crate::systemd::{SystemdControl, SystemdError, UnitOperation};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[derive(Debug)]
struct MemoryFile {
    data: Vec<u8>,
    mode: u32,
}

#[derive(Debug, Default)]
struct Tree {
    files: BTreeMap<PathBuf, MemoryFile>,
    dirs: BTreeSet<PathBuf>,
    writes: usize,
    temp_dirs: usize,
}

impl Tree {
    fn add_dir_with_parents(&mut self, path: &Path) {
        for dir in path.ancestors() {
            if !self.dirs.insert(dir.to_path_buf()) {
                break;
            }
        }
    }
}

/// A filesystem tree held in memory.
///
/// Writes require the parent directory to exist, just like the host.
#[derive(Debug)]
pub struct MemoryFileSystem {
    tree: Mutex<Tree>,
}

impl MemoryFileSystem {
    pub fn new() -> Self {
        let mut tree = Tree::default();
        tree.dirs.insert(PathBuf::from("/"));
        Self {
            tree: Mutex::new(tree),
        }
    }

    /// Seed a file, creating its parents. Not counted as a write.
    pub fn insert_file(&self, path: impl AsRef<Path>, data: &[u8], mode: u32) {
        let path = path.as_ref();
        let mut tree = lock(&self.tree);
        if let Some(parent) = path.parent() {
            tree.add_dir_with_parents(parent);
        }
        tree.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: data.to_vec(),
                mode,
            },
        );
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        lock(&self.tree).files.get(path.as_ref()).map(|f| f.data.clone())
    }

    pub fn mode(&self, path: impl AsRef<Path>) -> Option<u32> {
        lock(&self.tree).files.get(path.as_ref()).map(|f| f.mode)
    }

    pub fn is_dir(&self, path: impl AsRef<Path>) -> bool {
        lock(&self.tree).dirs.contains(path.as_ref())
    }

    /// All files below `dir`.
    pub fn files_under(&self, dir: impl AsRef<Path>) -> Vec<PathBuf> {
        lock(&self.tree)
            .files
            .keys()
            .filter(|p| p.starts_with(dir.as_ref()))
            .cloned()
            .collect()
    }

    /// Number of [`FileSystem::write`] calls so far.
    pub fn write_count(&self) -> usize {
        lock(&self.tree).writes
    }
}

impl Default for MemoryFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

fn not_found(op: &'static str, path: &Path) -> FsError {
    FsError::new(op, path, io::Error::from(io::ErrorKind::NotFound))
}

#[async_trait]
impl FileSystem for MemoryFileSystem {
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError> {
        let tree = lock(&self.tree);
        if tree.dirs.contains(path) {
            return Err(FsError::new("read", path, io::Error::other("is a directory")));
        }
        Ok(tree.files.get(path).map(|f| f.data.clone()))
    }

    async fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<(), FsError> {
        let mut tree = lock(&self.tree);
        let parent_exists = path.parent().is_some_and(|p| tree.dirs.contains(p));
        if !parent_exists {
            return Err(not_found("write", path));
        }
        if tree.dirs.contains(path) {
            return Err(FsError::new("write", path, io::Error::other("is a directory")));
        }
        tree.files.insert(
            path.to_path_buf(),
            MemoryFile {
                data: data.to_vec(),
                mode,
            },
        );
        tree.writes += 1;
        Ok(())
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        let mut tree = lock(&self.tree);
        if tree.dirs.contains(path) {
            return Ok(());
        }
        match tree.files.get_mut(path) {
            Some(file) => {
                file.mode = mode;
                Ok(())
            }
            None => Err(not_found("chmod", path)),
        }
    }

    async fn exists(&self, path: &Path) -> Result<bool, FsError> {
        let tree = lock(&self.tree);
        Ok(tree.files.contains_key(path) || tree.dirs.contains(path))
    }

    async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        lock(&self.tree).files.remove(path);
        Ok(())
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), FsError> {
        let mut tree = lock(&self.tree);
        tree.files.retain(|p, _| !p.starts_with(path));
        tree.dirs.retain(|p| !p.starts_with(path));
        Ok(())
    }

    async fn create_dir_all(&self, path: &Path, _mode: u32) -> Result<(), FsError> {
        let mut tree = lock(&self.tree);
        if let Some(file) = path.ancestors().find(|p| tree.files.contains_key(*p)) {
            return Err(FsError::new(
                "create directory",
                file,
                io::Error::other("not a directory"),
            ));
        }
        tree.add_dir_with_parents(path);
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let mut tree = lock(&self.tree);
        if !to.parent().is_some_and(|p| tree.dirs.contains(p)) {
            return Err(not_found("rename", to));
        }
        let file = tree.files.remove(from).ok_or_else(|| not_found("rename", from))?;
        tree.files.insert(to.to_path_buf(), file);
        Ok(())
    }

    async fn temp_dir(&self, parent: &Path, prefix: &str) -> Result<PathBuf, FsError> {
        let mut tree = lock(&self.tree);
        tree.temp_dirs += 1;
        let dir = parent.join(format!("{prefix}{}", tree.temp_dirs));
        tree.add_dir_with_parents(&dir);
        Ok(dir)
    }
}

/// Records unit operations; selected operations can be made to fail.
#[derive(Debug, Default)]
pub struct RecordingSystemd {
    calls: Mutex<Vec<(UnitOperation, String)>>,
    failures: Mutex<HashSet<(UnitOperation, String)>>,
}

impl RecordingSystemd {
    pub fn new() -> Self {
        Self::default()
    }

    /// Operations in call order. Daemon reloads are recorded with an empty unit.
    pub fn calls(&self) -> Vec<(UnitOperation, String)> {
        lock(&self.calls).clone()
    }

    /// Calls other than daemon reloads for `unit`.
    pub fn operations_on(&self, unit: &str) -> Vec<UnitOperation> {
        lock(&self.calls)
            .iter()
            .filter(|(_, u)| u == unit)
            .map(|(op, _)| *op)
            .collect()
    }

    pub fn fail_on(&self, op: UnitOperation, unit: &str) {
        lock(&self.failures).insert((op, unit.to_string()));
    }

    pub fn clear(&self) {
        lock(&self.calls).clear();
    }

    fn record(&self, op: UnitOperation, unit: &str) -> Result<(), SystemdError> {
        lock(&self.calls).push((op, unit.to_string()));
        if lock(&self.failures).contains(&(op, unit.to_string())) {
            return Err(SystemdError::Failed {
                op,
                unit: unit.to_string(),
                status: "exit status: 1".to_string(),
                stderr: "injected failure".to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl SystemdControl for RecordingSystemd {
    async fn enable(&self, unit: &str) -> Result<(), SystemdError> {
        self.record(UnitOperation::Enable, unit)
    }

    async fn disable(&self, unit: &str) -> Result<(), SystemdError> {
        self.record(UnitOperation::Disable, unit)
    }

    async fn start(&self, unit: &str) -> Result<(), SystemdError> {
        self.record(UnitOperation::Start, unit)
    }

    async fn stop(&self, unit: &str) -> Result<(), SystemdError> {
        self.record(UnitOperation::Stop, unit)
    }

    async fn restart(&self, unit: &str) -> Result<(), SystemdError> {
        self.record(UnitOperation::Restart, unit)
    }

    async fn daemon_reload(&self) -> Result<(), SystemdError> {
        self.record(UnitOperation::DaemonReload, "")
    }
}

/// Nodes and pods held in memory; patches are applied and recorded.
#[derive(Debug, Default)]
pub struct InMemoryNodeApi {
    nodes: Mutex<BTreeMap<String, Node>>,
    pods: Mutex<BTreeMap<String, Vec<PodRef>>>,
    deleted_pods: Mutex<Vec<PodRef>>,
    patches: Mutex<Vec<(String, NodePatch)>>,
}

impl InMemoryNodeApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_node(&self, node: Node) {
        lock(&self.nodes).insert(node.name.clone(), node);
    }

    pub fn node(&self, name: &str) -> Option<Node> {
        lock(&self.nodes).get(name).cloned()
    }

    pub fn add_pod(&self, node: &str, pod: PodRef) {
        lock(&self.pods).entry(node.to_string()).or_default().push(pod);
    }

    pub fn deleted_pods(&self) -> Vec<PodRef> {
        lock(&self.deleted_pods).clone()
    }

    pub fn patches(&self) -> Vec<(String, NodePatch)> {
        lock(&self.patches).clone()
    }
}

#[async_trait]
impl NodeApi for InMemoryNodeApi {
    async fn get_node(&self, name: &str) -> Result<Option<Node>, ApiError> {
        Ok(self.node(name))
    }

    async fn find_node_by_hostname(&self, hostname: &str) -> Result<Option<Node>, ApiError> {
        Ok(lock(&self.nodes)
            .values()
            .find(|n| n.label(LABEL_HOSTNAME) == Some(hostname))
            .cloned())
    }

    async fn patch_node(&self, name: &str, patch: &NodePatch) -> Result<(), ApiError> {
        let mut nodes = lock(&self.nodes);
        let node = nodes.get_mut(name).ok_or_else(|| ApiError::Status {
            method: "PATCH".to_string(),
            url: format!("/api/v1/nodes/{name}"),
            status: 404,
            body: "not found".to_string(),
        })?;
        patch.apply_to(node);
        lock(&self.patches).push((name.to_string(), patch.clone()));
        Ok(())
    }

    async fn list_pods_on_node(&self, name: &str) -> Result<Vec<PodRef>, ApiError> {
        Ok(lock(&self.pods).get(name).cloned().unwrap_or_default())
    }

    async fn delete_pod(&self, pod: &PodRef) -> Result<(), ApiError> {
        for pods in lock(&self.pods).values_mut() {
            pods.retain(|p| p != pod);
        }
        lock(&self.deleted_pods).push(pod.clone());
        Ok(())
    }
}

/// Serves files from a fixed `(image, path)` map and writes them through
/// the given filesystem.
pub struct StaticImageExtractor {
    fs: Arc<dyn FileSystem>,
    files: Mutex<BTreeMap<(String, String), Vec<u8>>>,
    copies: AtomicUsize,
}

impl StaticImageExtractor {
    pub fn new(fs: Arc<dyn FileSystem>) -> Self {
        Self {
            fs,
            files: Mutex::new(BTreeMap::new()),
            copies: AtomicUsize::new(0),
        }
    }

    pub fn with_file(self, image: &str, path_in_image: &str, data: &[u8]) -> Self {
        self.insert(image, path_in_image, data);
        self
    }

    pub fn insert(&self, image: &str, path_in_image: &str, data: &[u8]) {
        lock(&self.files).insert((image.to_string(), path_in_image.to_string()), data.to_vec());
    }

    /// Successful copies so far.
    pub fn copies(&self) -> usize {
        self.copies.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageExtractor for StaticImageExtractor {
    async fn copy_from_image(
        &self,
        image: &str,
        path_in_image: &str,
        dest: &Path,
        mode: u32,
    ) -> Result<(), ImageError> {
        let key = (image.to_string(), path_in_image.to_string());
        let data = lock(&self.files)
            .get(&key)
            .cloned()
            .ok_or_else(|| ImageError::new(image, path_in_image, dest, ExtractError::FileNotFound))?;

        let write = async {
            if let Some(parent) = dest.parent() {
                self.fs.create_dir_all(parent, DEFAULT_DIR_PERMISSIONS).await?;
            }
            self.fs.write(dest, &data, mode).await
        };
        write
            .await
            .map_err(|e| ImageError::new(image, path_in_image, dest, e))?;

        self.copies.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Records update requests instead of running a script.
///
/// Optionally rewrites os-release with the requested version, as a
/// successful update would.
#[derive(Default)]
pub struct FakeUpdateExecutor {
    calls: Mutex<Vec<(PathBuf, String)>>,
    fail: AtomicBool,
    os_release: Option<(Arc<dyn FileSystem>, PathBuf)>,
}

impl FakeUpdateExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn writing_os_release(fs: Arc<dyn FileSystem>, path: impl Into<PathBuf>) -> Self {
        Self {
            os_release: Some((fs, path.into())),
            ..Self::default()
        }
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn calls(&self) -> Vec<(PathBuf, String)> {
        lock(&self.calls).clone()
    }
}

#[async_trait]
impl OsUpdateExecutor for FakeUpdateExecutor {
    async fn run(&self, script: &Path, version: &str) -> Result<(), OsUpdateError> {
        lock(&self.calls).push((script.to_path_buf(), version.to_string()));

        if self.fail.load(Ordering::SeqCst) {
            return Err(OsUpdateError::Failed {
                script: script.to_path_buf(),
                version: version.to_string(),
                status: "exit status: 1".to_string(),
                output: "injected failure".to_string(),
            });
        }

        if let Some((fs, path)) = &self.os_release {
            let content = format!("PRETTY_NAME=\"Garden Linux {version}\"\n");
            fs.write(path, content.as_bytes(), 0o644)
                .await
                .map_err(|e| OsUpdateError::Spawn {
                    script: script.to_path_buf(),
                    source: e.source,
                })?;
        }
        Ok(())
    }
}

/// Serves a configuration blob that tests can replace between passes.
#[derive(Debug, Default)]
pub struct StaticConfigSource {
    blob: Mutex<Option<ConfigBlob>>,
    fetches: AtomicUsize,
}

impl StaticConfigSource {
    pub fn new(raw: impl Into<Vec<u8>>) -> Self {
        let source = Self::empty();
        source.set(raw);
        source
    }

    /// A source that has no configuration yet.
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn set(&self, raw: impl Into<Vec<u8>>) {
        *lock(&self.blob) = Some(ConfigBlob::new(raw.into()));
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigSource for StaticConfigSource {
    async fn fetch(&self) -> Result<Option<ConfigBlob>, SourceError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(lock(&self.blob).clone())
    }
}

/// Kubelet health that tests flip by hand.
#[derive(Debug)]
pub struct StaticKubeletHealth {
    healthy: AtomicBool,
    probes: AtomicUsize,
}

impl StaticKubeletHealth {
    pub fn new(healthy: bool) -> Self {
        Self {
            healthy: AtomicBool::new(healthy),
            probes: AtomicUsize::new(0),
        }
    }

    pub fn set(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }

    pub fn probes(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KubeletHealth for StaticKubeletHealth {
    async fn is_healthy(&self) -> bool {
        self.probes.fetch_add(1, Ordering::SeqCst);
        self.healthy.load(Ordering::SeqCst)
    }
}

/// One fake per capability, sharing a single in-memory filesystem.
///
/// The update executor rewrites `/etc/os-release` with the requested
/// version. The kubelet reports healthy.
pub struct FakeCapabilities {
    pub source: Arc<StaticConfigSource>,
    pub node_api: Arc<InMemoryNodeApi>,
    pub fs: Arc<MemoryFileSystem>,
    pub systemd: Arc<RecordingSystemd>,
    pub images: Arc<StaticImageExtractor>,
    pub os_update: Arc<FakeUpdateExecutor>,
    pub kubelet_health: Arc<StaticKubeletHealth>,
}

impl FakeCapabilities {
    pub fn new() -> Self {
        let fs = Arc::new(MemoryFileSystem::new());
        Self {
            source: Arc::new(StaticConfigSource::empty()),
            node_api: Arc::new(InMemoryNodeApi::new()),
            systemd: Arc::new(RecordingSystemd::new()),
            images: Arc::new(StaticImageExtractor::new(fs.clone())),
            os_update: Arc::new(FakeUpdateExecutor::writing_os_release(
                fs.clone(),
                NodePaths::default().os_release,
            )),
            kubelet_health: Arc::new(StaticKubeletHealth::new(true)),
            fs,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            source: self.source.clone(),
            node_api: self.node_api.clone(),
            fs: self.fs.clone(),
            systemd: self.systemd.clone(),
            images: self.images.clone(),
            os_update: self.os_update.clone(),
            kubelet_health: self.kubelet_health.clone(),
        }
    }
}

impl Default for FakeCapabilities {
    fn default() -> Self {
        Self::new()
    }
}
