//! Filesystem capability.
//!
//! Every file the agent touches goes through [`FileSystem`], so the whole
//! reconciliation can run against an in-memory tree in tests. The host
//! implementation can be rooted below a prefix directory.

use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Component, Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use gardener_reconcile::Checksum;
use thiserror::Error;
use tracing::debug;

/// Mode for directories created by the agent.
pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;

/// A filesystem operation that failed, with the path it failed on.
#[derive(Debug, Error)]
#[error("unable to {op} {path:?}: {source}")]
pub struct FsError {
    pub op: &'static str,
    pub path: PathBuf,
    #[source]
    pub source: io::Error,
}

impl FsError {
    pub fn new(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self {
            op,
            path: path.into(),
            source,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.source.kind() == io::ErrorKind::NotFound
    }
}

/// Filesystem operations the agent needs.
///
/// Removal operations are idempotent: a missing target is not an error.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read a file. Returns `None` if it does not exist.
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError>;

    /// Create or truncate a file and set its mode. The parent must exist.
    async fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<(), FsError>;

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError>;

    async fn exists(&self, path: &Path) -> Result<bool, FsError>;

    async fn remove_file(&self, path: &Path) -> Result<(), FsError>;

    async fn remove_dir_all(&self, path: &Path) -> Result<(), FsError>;

    async fn create_dir_all(&self, path: &Path, mode: u32) -> Result<(), FsError>;

    /// Move `from` onto `to`, replacing it.
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Create a fresh, uniquely named directory below `parent`.
    async fn temp_dir(&self, parent: &Path, prefix: &str) -> Result<PathBuf, FsError>;
}

/// Write `data` to `path` by writing a sibling in `tmp_dir` and renaming it.
///
/// Missing parent directories of `path` are created with mode 0755.
pub async fn write_atomic(
    fs: &dyn FileSystem,
    tmp_dir: &Path,
    path: &Path,
    data: &[u8],
    mode: u32,
) -> Result<(), FsError> {
    if let Some(parent) = path.parent() {
        fs.create_dir_all(parent, DEFAULT_DIR_PERMISSIONS).await?;
    }
    fs.create_dir_all(tmp_dir, DEFAULT_DIR_PERMISSIONS).await?;

    let tmp_path = tmp_dir.join(temp_name(path));
    fs.write(&tmp_path, data, mode).await?;
    fs.rename(&tmp_path, path).await?;

    debug!(path = %path.display(), bytes = data.len(), "File written");
    Ok(())
}

/// Like [`write_atomic`], but skips the write when the bytes are unchanged.
/// The mode is enforced either way. Returns whether the file was written.
pub async fn write_if_changed(
    fs: &dyn FileSystem,
    tmp_dir: &Path,
    path: &Path,
    data: &[u8],
    mode: u32,
) -> Result<bool, FsError> {
    let unchanged = fs.read(path).await?.is_some_and(|old| old == data);
    if unchanged {
        fs.chmod(path, mode).await?;
        return Ok(false);
    }

    write_atomic(fs, tmp_dir, path, data, mode).await?;
    Ok(true)
}

/// Temporary file name for a target path; unique per target.
fn temp_name(path: &Path) -> String {
    let digest = Checksum::of(path.as_os_str().as_encoded_bytes());
    format!("{}.tmp", &digest.as_str()[..16])
}

/// The node's real filesystem, optionally below a root prefix.
#[derive(Debug, Clone)]
pub struct HostFileSystem {
    root: PathBuf,
}

impl HostFileSystem {
    /// Operate on the real root.
    pub fn new() -> Self {
        Self::rooted("/")
    }

    /// Operate below `root`; absolute paths are resolved relative to it.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Map an agent path onto the host.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        let relative: PathBuf = path
            .components()
            .filter(|c| matches!(c, Component::Normal(_)))
            .collect();
        self.root.join(relative)
    }

    async fn copy_then_remove(&self, from: &Path, to: &Path) -> io::Result<()> {
        tokio::fs::copy(from, to).await?;
        tokio::fs::remove_file(from).await
    }
}

impl Default for HostFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for HostFileSystem {
    async fn read(&self, path: &Path) -> Result<Option<Vec<u8>>, FsError> {
        match tokio::fs::read(self.resolve(path)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(FsError::new("read", path, e)),
        }
    }

    async fn write(&self, path: &Path, data: &[u8], mode: u32) -> Result<(), FsError> {
        let host = self.resolve(path);
        tokio::fs::write(&host, data)
            .await
            .map_err(|e| FsError::new("write", path, e))?;
        tokio::fs::set_permissions(&host, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| FsError::new("chmod", path, e))
    }

    async fn chmod(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        tokio::fs::set_permissions(self.resolve(path), std::fs::Permissions::from_mode(mode))
            .await
            .map_err(|e| FsError::new("chmod", path, e))
    }

    async fn exists(&self, path: &Path) -> Result<bool, FsError> {
        tokio::fs::try_exists(self.resolve(path))
            .await
            .map_err(|e| FsError::new("stat", path, e))
    }

    async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        match tokio::fs::remove_file(self.resolve(path)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(FsError::new("remove", path, e)),
            _ => Ok(()),
        }
    }

    async fn remove_dir_all(&self, path: &Path) -> Result<(), FsError> {
        match tokio::fs::remove_dir_all(self.resolve(path)).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(FsError::new("remove", path, e)),
            _ => Ok(()),
        }
    }

    async fn create_dir_all(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        let host = self.resolve(path);
        if tokio::fs::try_exists(&host).await.unwrap_or(false) {
            return Ok(());
        }
        tokio::fs::DirBuilder::new()
            .recursive(true)
            .mode(mode)
            .create(&host)
            .await
            .map_err(|e| FsError::new("create directory", path, e))
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        let (host_from, host_to) = (self.resolve(from), self.resolve(to));
        match tokio::fs::rename(&host_from, &host_to).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::CrossesDevices => {
                debug!(from = %from.display(), to = %to.display(), "Rename crosses devices, copying");
                self.copy_then_remove(&host_from, &host_to)
                    .await
                    .map_err(|e| FsError::new("move", to, e))
            }
            Err(e) => Err(FsError::new("rename", to, e)),
        }
    }

    async fn temp_dir(&self, parent: &Path, prefix: &str) -> Result<PathBuf, FsError> {
        self.create_dir_all(parent, DEFAULT_DIR_PERMISSIONS).await?;

        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        let mut attempt = 0u64;
        loop {
            let dir = parent.join(format!("{prefix}{}-{nanos:x}-{attempt}", std::process::id()));
            match tokio::fs::create_dir(self.resolve(&dir)).await {
                Ok(()) => return Ok(dir),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => attempt += 1,
                Err(e) => return Err(FsError::new("create directory", dir, e)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn rooted() -> (TempDir, HostFileSystem) {
        let dir = TempDir::new().unwrap();
        let fs = HostFileSystem::rooted(dir.path());
        (dir, fs)
    }

    #[test]
    fn test_resolve_strips_root_and_parent_components() {
        let fs = HostFileSystem::rooted("/srv/node");
        assert_eq!(
            fs.resolve(Path::new("/etc/systemd/system/kubelet.service")),
            PathBuf::from("/srv/node/etc/systemd/system/kubelet.service")
        );
        assert_eq!(
            fs.resolve(Path::new("/etc/../../shadow")),
            PathBuf::from("/srv/node/etc/shadow")
        );
    }

    #[tokio::test]
    async fn test_write_atomic_creates_parents_and_sets_mode() {
        let (dir, fs) = rooted();
        let target = Path::new("/etc/example/file");

        write_atomic(&fs, Path::new("/tmp-dir"), target, b"hello", 0o640)
            .await
            .unwrap();

        let host = dir.path().join("etc/example/file");
        assert_eq!(std::fs::read(&host).unwrap(), b"hello");
        let mode = std::fs::metadata(&host).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o640);

        let parent_mode = std::fs::metadata(dir.path().join("etc/example"))
            .unwrap()
            .permissions()
            .mode()
            & 0o777;
        assert_eq!(parent_mode, 0o755);

        // the temporary file was moved, not copied
        let leftovers = std::fs::read_dir(dir.path().join("tmp-dir")).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn test_write_if_changed_skips_identical_bytes() {
        let (dir, fs) = rooted();
        let target = Path::new("/unit.service");
        let tmp = Path::new("/tmp");

        assert!(write_if_changed(&fs, tmp, target, b"a", 0o600).await.unwrap());

        let host = dir.path().join("unit.service");
        std::fs::set_permissions(&host, std::fs::Permissions::from_mode(0o777)).unwrap();

        assert!(!write_if_changed(&fs, tmp, target, b"a", 0o600).await.unwrap());
        let mode = std::fs::metadata(&host).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o600);

        assert!(write_if_changed(&fs, tmp, target, b"b", 0o600).await.unwrap());
        assert_eq!(std::fs::read(&host).unwrap(), b"b");
    }

    #[tokio::test]
    async fn test_removal_is_idempotent() {
        let (_dir, fs) = rooted();
        fs.remove_file(Path::new("/missing")).await.unwrap();
        fs.remove_dir_all(Path::new("/missing.d")).await.unwrap();
        assert_eq!(fs.read(Path::new("/missing")).await.unwrap(), None);
        assert!(!fs.exists(Path::new("/missing")).await.unwrap());
    }

    #[tokio::test]
    async fn test_temp_dirs_are_unique() {
        let (dir, fs) = rooted();
        let parent = Path::new("/var/lib/agent/tmp");

        let a = fs.temp_dir(parent, "osc-").await.unwrap();
        let b = fs.temp_dir(parent, "osc-").await.unwrap();

        assert_ne!(a, b);
        assert!(a.starts_with(parent));
        assert!(dir.path().join("var/lib/agent/tmp").is_dir());
    }
}
