//! Filesystem abstraction.
//!
//! Everything the lifecycle controller does to the host filesystem outside
//! of writing the archive itself goes through `Filesystem`, so retention and
//! permission handling can be tested against `MockFilesystem`.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::UNIX_EPOCH;

use thiserror::Error;

/// Errors from filesystem operations.
#[derive(Debug, Error)]
pub enum FsError {
    #[error("{op} {}: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl FsError {
    pub fn io(op: &'static str, path: &Path, source: io::Error) -> Self {
        FsError::Io {
            op,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// A regular file found in a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: PathBuf,
    pub modified_unix_sec: u64,
}

impl FileEntry {
    /// Final path component as UTF-8, if it is valid UTF-8.
    pub fn file_name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

/// Filesystem operations used by the backup run.
pub trait Filesystem: Send + Sync {
    /// Create a directory and its parents. Succeeds if it already exists.
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError>;

    /// Whether a file or directory exists at `path`.
    fn exists(&self, path: &Path) -> bool;

    /// Regular files directly inside `dir`, sorted by path.
    /// A missing directory yields an empty list.
    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, FsError>;

    fn remove_file(&self, path: &Path) -> Result<(), FsError>;

    /// Set the permission bits (e.g. `0o774`).
    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError>;

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), FsError>;
}

impl<F: Filesystem + ?Sized> Filesystem for &F {
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        (**self).create_dir_all(path)
    }

    fn exists(&self, path: &Path) -> bool {
        (**self).exists(path)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, FsError> {
        (**self).list_files(dir)
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        (**self).remove_file(path)
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        (**self).set_mode(path, mode)
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), FsError> {
        (**self).set_owner(path, uid, gid)
    }
}

/// The host filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealFilesystem;

impl Filesystem for RealFilesystem {
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        fs::create_dir_all(path).map_err(|e| FsError::io("create directory", path, e))
    }

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, FsError> {
        let mut files = Vec::new();

        if !dir.exists() {
            return Ok(files);
        }

        let entries = fs::read_dir(dir).map_err(|e| FsError::io("read directory", dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| FsError::io("read directory", dir, e))?;
            let path = entry.path();
            let metadata = match fs::metadata(&path) {
                Ok(m) => m,
                // Raced with a concurrent delete.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::io("stat", &path, e)),
            };
            if !metadata.is_file() {
                continue;
            }
            let modified_unix_sec = metadata
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            files.push(FileEntry {
                path,
                modified_unix_sec,
            });
        }

        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        fs::remove_file(path).map_err(|e| FsError::io("remove", path, e))
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        fs::set_permissions(path, fs::Permissions::from_mode(mode))
            .map_err(|e| FsError::io("chmod", path, e))
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), FsError> {
        std::os::unix::fs::chown(path, Some(uid), Some(gid))
            .map_err(|e| FsError::io("chown", path, e))
    }
}

/// State of one file in `MockFilesystem`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MockFile {
    pub modified_unix_sec: u64,
    pub mode: u32,
    pub owner: Option<(u32, u32)>,
}

/// In-memory filesystem for tests.
/// Cloning creates a new handle to the same underlying data.
#[derive(Debug, Clone, Default)]
pub struct MockFilesystem {
    files: Arc<RwLock<BTreeMap<PathBuf, MockFile>>>,
    dirs: Arc<RwLock<BTreeSet<PathBuf>>>,
    failing_removes: Arc<RwLock<HashSet<PathBuf>>>,
    failing_dirs: Arc<RwLock<HashSet<PathBuf>>>,
    failing_permissions: Arc<RwLock<HashSet<PathBuf>>>,
}

impl MockFilesystem {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a file with the given modification time (for test setup).
    pub fn add_file(&self, path: impl Into<PathBuf>, modified_unix_sec: u64) {
        self.files.write().unwrap().insert(
            path.into(),
            MockFile {
                modified_unix_sec,
                mode: 0o644,
                owner: None,
            },
        );
    }

    pub fn file(&self, path: &Path) -> Option<MockFile> {
        self.files.read().unwrap().get(path).cloned()
    }

    pub fn has_file(&self, path: &Path) -> bool {
        self.files.read().unwrap().contains_key(path)
    }

    /// All file paths, sorted.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.files.read().unwrap().keys().cloned().collect()
    }

    pub fn has_dir(&self, path: &Path) -> bool {
        self.dirs.read().unwrap().contains(path)
    }

    /// Make every later `remove_file(path)` fail with permission denied.
    pub fn fail_remove(&self, path: impl Into<PathBuf>) {
        self.failing_removes.write().unwrap().insert(path.into());
    }

    /// Make every later `create_dir_all(path)` fail with permission denied.
    pub fn fail_create_dir(&self, path: impl Into<PathBuf>) {
        self.failing_dirs.write().unwrap().insert(path.into());
    }

    /// Make every later `set_mode` / `set_owner` on `path` fail.
    pub fn fail_permissions(&self, path: impl Into<PathBuf>) {
        self.failing_permissions.write().unwrap().insert(path.into());
    }
}

fn denied() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "permission denied")
}

fn not_found() -> io::Error {
    io::Error::new(io::ErrorKind::NotFound, "no such file or directory")
}

impl Filesystem for MockFilesystem {
    fn create_dir_all(&self, path: &Path) -> Result<(), FsError> {
        if self.failing_dirs.read().unwrap().contains(path) {
            return Err(FsError::io("create directory", path, denied()));
        }
        let mut dirs = self.dirs.write().unwrap();
        for ancestor in path.ancestors() {
            if ancestor.as_os_str().is_empty() {
                continue;
            }
            dirs.insert(ancestor.to_path_buf());
        }
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        self.has_file(path) || self.has_dir(path)
    }

    fn list_files(&self, dir: &Path) -> Result<Vec<FileEntry>, FsError> {
        Ok(self
            .files
            .read()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.parent() == Some(dir))
            .map(|(path, file)| FileEntry {
                path: path.clone(),
                modified_unix_sec: file.modified_unix_sec,
            })
            .collect())
    }

    fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        if self.failing_removes.read().unwrap().contains(path) {
            return Err(FsError::io("remove", path, denied()));
        }
        match self.files.write().unwrap().remove(path) {
            Some(_) => Ok(()),
            None => Err(FsError::io("remove", path, not_found())),
        }
    }

    fn set_mode(&self, path: &Path, mode: u32) -> Result<(), FsError> {
        if self.failing_permissions.read().unwrap().contains(path) {
            return Err(FsError::io("chmod", path, denied()));
        }
        match self.files.write().unwrap().get_mut(path) {
            Some(file) => {
                file.mode = mode;
                Ok(())
            }
            None => Err(FsError::io("chmod", path, not_found())),
        }
    }

    fn set_owner(&self, path: &Path, uid: u32, gid: u32) -> Result<(), FsError> {
        if self.failing_permissions.read().unwrap().contains(path) {
            return Err(FsError::io("chown", path, denied()));
        }
        match self.files.write().unwrap().get_mut(path) {
            Some(file) => {
                file.owner = Some((uid, gid));
                Ok(())
            }
            None => Err(FsError::io("chown", path, not_found())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, SystemTime};
    use tempfile::tempdir;

    // ===========================================
    // MockFilesystem
    // ===========================================

    #[test]
    fn test_mock_create_dir_all_registers_ancestors() {
        let fs = MockFilesystem::new();
        fs.create_dir_all(Path::new("/backup/host1")).expect("mkdir");

        assert!(fs.exists(Path::new("/backup/host1")));
        assert!(fs.exists(Path::new("/backup")));
        assert!(!fs.exists(Path::new("/other")));
    }

    #[test]
    fn test_mock_create_dir_all_failure() {
        let fs = MockFilesystem::new();
        fs.fail_create_dir("/backup");

        let err = fs.create_dir_all(Path::new("/backup")).unwrap_err();
        assert!(err.to_string().contains("/backup"));
    }

    #[test]
    fn test_mock_list_files_only_direct_children() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/a.tar", 10);
        fs.add_file("/backup/b.tar", 20);
        fs.add_file("/backup/nested/c.tar", 30);
        fs.add_file("/elsewhere/d.tar", 40);

        let files = fs.list_files(Path::new("/backup")).expect("list");
        let names: Vec<_> = files.iter().filter_map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["a.tar", "b.tar"]);
        assert_eq!(files[1].modified_unix_sec, 20);
    }

    #[test]
    fn test_mock_list_missing_dir_is_empty() {
        let fs = MockFilesystem::new();
        assert!(fs.list_files(Path::new("/nothing")).unwrap().is_empty());
    }

    #[test]
    fn test_mock_remove_file() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/a.tar", 10);

        fs.remove_file(Path::new("/backup/a.tar")).expect("remove");
        assert!(!fs.has_file(Path::new("/backup/a.tar")));
        assert!(fs.remove_file(Path::new("/backup/a.tar")).is_err());
    }

    #[test]
    fn test_mock_remove_failure_injection() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/a.tar", 10);
        fs.fail_remove("/backup/a.tar");

        assert!(fs.remove_file(Path::new("/backup/a.tar")).is_err());
        assert!(fs.has_file(Path::new("/backup/a.tar")));
    }

    #[test]
    fn test_mock_mode_and_owner() {
        let fs = MockFilesystem::new();
        let path = Path::new("/backup/a.tar");
        fs.add_file(path, 10);

        fs.set_mode(path, 0o774).expect("chmod");
        fs.set_owner(path, 0, 4).expect("chown");

        let file = fs.file(path).unwrap();
        assert_eq!(file.mode, 0o774);
        assert_eq!(file.owner, Some((0, 4)));
        assert!(fs.set_mode(Path::new("/missing"), 0o600).is_err());
    }

    #[test]
    fn test_mock_clone_shares_state() {
        let fs = MockFilesystem::new();
        let clone = fs.clone();
        clone.add_file("/x", 1);
        assert!(fs.has_file(Path::new("/x")));
    }

    // ===========================================
    // RealFilesystem
    // ===========================================

    #[test]
    fn test_real_list_files_skips_directories() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("b.tar"), b"b").unwrap();
        fs::write(dir.path().join("a.tar"), b"a").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();

        let files = RealFilesystem.list_files(dir.path()).expect("list");
        let names: Vec<_> = files.iter().filter_map(|f| f.file_name()).collect();
        assert_eq!(names, vec!["a.tar", "b.tar"]);
    }

    #[test]
    fn test_real_list_files_reports_mtime() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("old.tar");
        fs::write(&path, b"x").unwrap();
        let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000);
        fs::File::options()
            .write(true)
            .open(&path)
            .unwrap()
            .set_modified(mtime)
            .unwrap();

        let files = RealFilesystem.list_files(dir.path()).expect("list");
        assert_eq!(files[0].modified_unix_sec, 1_000_000);
    }

    #[test]
    fn test_real_list_missing_dir_is_empty() {
        let dir = tempdir().unwrap();
        let files = RealFilesystem.list_files(&dir.path().join("missing")).unwrap();
        assert!(files.is_empty());
    }

    #[test]
    fn test_real_create_dir_all_idempotent() {
        let dir = tempdir().unwrap();
        let target = dir.path().join("a/b/c");
        RealFilesystem.create_dir_all(&target).expect("first");
        RealFilesystem.create_dir_all(&target).expect("second");
        assert!(RealFilesystem.exists(&target));
    }

    #[test]
    fn test_real_set_mode() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("f");
        fs::write(&path, b"x").unwrap();

        RealFilesystem.set_mode(&path, 0o640).expect("chmod");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o640);
    }

    #[test]
    fn test_real_remove_missing_reports_path() {
        let dir = tempdir().unwrap();
        let err = RealFilesystem
            .remove_file(&dir.path().join("gone"))
            .unwrap_err();
        assert!(err.to_string().contains("gone"));
    }
}
