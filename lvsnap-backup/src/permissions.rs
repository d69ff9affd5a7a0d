//! Permission normalization of the archive directory.
//!
//! After a successful archive every regular file in the host backup
//! directory gets the configured mode and, when configured, owner, so other
//! services (restore jobs, offsite sync) can read them. Failures are
//! collected per file and never fail the run.

use std::path::{Path, PathBuf};

use lvsnap_fs::{Filesystem, FsError};
use thiserror::Error;

/// A file whose mode or owner could not be changed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to update permissions of {}: {reason}", path.display())]
pub struct PermissionFailure {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PermissionReport {
    pub updated: Vec<PathBuf>,
    pub failures: Vec<PermissionFailure>,
}

/// Apply `mode` and optional `owner` to every regular file in `dir`.
pub fn normalize<F: Filesystem>(
    fs: &F,
    dir: &Path,
    mode: u32,
    owner: Option<(u32, u32)>,
) -> Result<PermissionReport, FsError> {
    let mut report = PermissionReport::default();

    for entry in fs.list_files(dir)? {
        let applied = fs.set_mode(&entry.path, mode).and_then(|()| match owner {
            Some((uid, gid)) => fs.set_owner(&entry.path, uid, gid),
            None => Ok(()),
        });
        match applied {
            Ok(()) => report.updated.push(entry.path),
            Err(e) => report.failures.push(PermissionFailure {
                path: entry.path,
                reason: e.to_string(),
            }),
        }
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use lvsnap_fs::MockFilesystem;

    #[test]
    fn test_sets_mode_on_every_file() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/db1/a.tar", 1);
        fs.add_file("/backup/db1/b.tar.gz", 2);
        fs.add_file("/backup/other/c.tar", 3);

        let report = normalize(&fs, Path::new("/backup/db1"), 0o774, None).unwrap();

        assert_eq!(report.updated.len(), 2);
        assert!(report.failures.is_empty());
        assert_eq!(fs.file(Path::new("/backup/db1/a.tar")).unwrap().mode, 0o774);
        assert_eq!(fs.file(Path::new("/backup/db1/a.tar")).unwrap().owner, None);
        assert_eq!(fs.file(Path::new("/backup/other/c.tar")).unwrap().mode, 0o644);
    }

    #[test]
    fn test_sets_owner_when_configured() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/db1/a.tar", 1);

        normalize(&fs, Path::new("/backup/db1"), 0o640, Some((0, 4))).unwrap();

        let file = fs.file(Path::new("/backup/db1/a.tar")).unwrap();
        assert_eq!(file.mode, 0o640);
        assert_eq!(file.owner, Some((0, 4)));
    }

    #[test]
    fn test_failure_is_recorded_and_others_continue() {
        let fs = MockFilesystem::new();
        fs.add_file("/backup/db1/a.tar", 1);
        fs.add_file("/backup/db1/b.tar", 2);
        fs.fail_permissions("/backup/db1/a.tar");

        let report = normalize(&fs, Path::new("/backup/db1"), 0o774, Some((0, 4))).unwrap();

        assert_eq!(report.updated, vec![PathBuf::from("/backup/db1/b.tar")]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, PathBuf::from("/backup/db1/a.tar"));
        assert!(report.failures[0].to_string().contains("permission denied"));
    }

    #[test]
    fn test_missing_directory_is_empty() {
        let fs = MockFilesystem::new();
        let report = normalize(&fs, Path::new("/nowhere"), 0o774, None).unwrap();
        assert_eq!(report, PermissionReport::default());
    }
}
