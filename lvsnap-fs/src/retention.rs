//! Retention sweep for archive files.
//!
//! Removes archives of the current host/filesystem whose modification time
//! is older than the configured age. Files with foreign names are never
//! touched, whatever their age. A failed deletion is recorded and the sweep
//! moves on to the next file.

use std::path::{Path, PathBuf};

use lvsnap_clock::SECS_PER_DAY;
use thiserror::Error;

use crate::fs::{Filesystem, FsError};
use crate::naming::ArchiveNaming;

/// Maximum age of archives to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub max_age_secs: u64,
}

impl RetentionPolicy {
    pub fn new(max_age_secs: u64) -> Self {
        Self { max_age_secs }
    }

    pub fn from_days(days: u64) -> Self {
        Self::new(days.saturating_mul(SECS_PER_DAY))
    }

    /// A file is expired when it was last modified strictly before
    /// `now - max_age_secs`.
    pub fn is_expired(&self, modified_unix_sec: u64, now_unix_sec: u64) -> bool {
        modified_unix_sec < now_unix_sec.saturating_sub(self.max_age_secs)
    }
}

/// One expired archive that could not be deleted.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("failed to delete expired archive {}: {reason}", path.display())]
pub struct RetentionDeleteFailed {
    pub path: PathBuf,
    pub reason: String,
}

/// Outcome of one sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepResult {
    /// Matching archives considered.
    pub examined: usize,
    pub removed: Vec<PathBuf>,
    pub kept: Vec<PathBuf>,
    pub failures: Vec<RetentionDeleteFailed>,
}

/// Delete expired archives in `dir` that belong to `naming`.
///
/// Only a failure to list `dir` is returned as an error; per-file deletion
/// failures are collected in `SweepResult::failures`.
pub fn sweep<F: Filesystem>(
    fs: &F,
    dir: &Path,
    naming: &ArchiveNaming,
    policy: &RetentionPolicy,
    now_unix_sec: u64,
) -> Result<SweepResult, FsError> {
    let mut result = SweepResult::default();

    for entry in fs.list_files(dir)? {
        let owned = entry.file_name().map_or(false, |name| naming.matches(name));
        if !owned {
            continue;
        }
        result.examined += 1;

        if !policy.is_expired(entry.modified_unix_sec, now_unix_sec) {
            result.kept.push(entry.path);
            continue;
        }

        match fs.remove_file(&entry.path) {
            Ok(()) => result.removed.push(entry.path),
            Err(e) => result.failures.push(RetentionDeleteFailed {
                path: entry.path,
                reason: e.to_string(),
            }),
        }
    }

    Ok(result)
}

/// Delete unfinished archives of `naming` left in `dir` by an interrupted
/// run, whatever their age.
pub fn remove_partials<F: Filesystem>(
    fs: &F,
    dir: &Path,
    naming: &ArchiveNaming,
) -> Result<SweepResult, FsError> {
    let mut result = SweepResult::default();

    for entry in fs.list_files(dir)? {
        let partial = entry
            .file_name()
            .map_or(false, |name| naming.matches_partial(name));
        if !partial {
            continue;
        }
        result.examined += 1;

        match fs.remove_file(&entry.path) {
            Ok(()) => result.removed.push(entry.path),
            Err(e) => result.failures.push(RetentionDeleteFailed {
                path: entry.path,
                reason: e.to_string(),
            }),
        }
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::MockFilesystem;

    const DAY: u64 = SECS_PER_DAY;
    const NOW: u64 = 1_704_067_200 + 30 * DAY;

    fn naming() -> ArchiveNaming {
        ArchiveNaming::new("db1", Path::new("/data"))
    }

    fn archive(dir: &str, ts: u64, compressed: bool) -> PathBuf {
        Path::new(dir).join(naming().file_name(ts, compressed))
    }

    // ===========================================
    // RetentionPolicy
    // ===========================================

    #[test]
    fn test_policy_from_days() {
        assert_eq!(RetentionPolicy::from_days(3).max_age_secs, 3 * DAY);
    }

    #[test]
    fn test_policy_boundary_is_kept() {
        let policy = RetentionPolicy::new(1000);
        // Exactly max_age old: not strictly older, kept.
        assert!(!policy.is_expired(4000, 5000));
        assert!(policy.is_expired(3999, 5000));
    }

    #[test]
    fn test_policy_future_mtime_is_kept() {
        let policy = RetentionPolicy::new(10);
        assert!(!policy.is_expired(9_000, 1_000));
    }

    #[test]
    fn test_policy_age_larger_than_now() {
        let policy = RetentionPolicy::from_days(365_000);
        assert!(!policy.is_expired(0, NOW));
    }

    // ===========================================
    // sweep
    // ===========================================

    #[test]
    fn test_sweep_empty_directory() {
        let fs = MockFilesystem::new();
        let result = sweep(
            &fs,
            Path::new("/backup/db1"),
            &naming(),
            &RetentionPolicy::from_days(3),
            NOW,
        )
        .expect("sweep");
        assert_eq!(result, SweepResult::default());
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let fs = MockFilesystem::new();
        let old = archive("/backup/db1", NOW - 4 * DAY, true);
        let fresh = archive("/backup/db1", NOW - 2 * DAY, true);
        fs.add_file(old.clone(), NOW - 4 * DAY);
        fs.add_file(fresh.clone(), NOW - 2 * DAY);

        let result = sweep(
            &fs,
            Path::new("/backup/db1"),
            &naming(),
            &RetentionPolicy::from_days(3),
            NOW,
        )
        .expect("sweep");

        assert_eq!(result.examined, 2);
        assert_eq!(result.removed, vec![old.clone()]);
        assert_eq!(result.kept, vec![fresh.clone()]);
        assert!(!fs.has_file(&old));
        assert!(fs.has_file(&fresh));
    }

    #[test]
    fn test_sweep_uses_mtime_not_name_timestamp() {
        let fs = MockFilesystem::new();
        // Name says old, file was touched recently.
        let path = archive("/backup/db1", NOW - 10 * DAY, false);
        fs.add_file(path.clone(), NOW - DAY);

        let result = sweep(
            &fs,
            Path::new("/backup/db1"),
            &naming(),
            &RetentionPolicy::from_days(3),
            NOW,
        )
        .expect("sweep");

        assert!(result.removed.is_empty());
        assert!(fs.has_file(&path));
    }

    #[test]
    fn test_sweep_never_touches_foreign_names() {
        let fs = MockFilesystem::new();
        let ancient = 1_000;
        let foreign = [
            "/backup/db1/web1_data.2020-01-01:00:00:00.tar.gz",
            "/backup/db1/db1_srv.2020-01-01:00:00:00.tar.gz",
            "/backup/db1/db1_data.2020-01-01:00:00:00.tar.gz.partial",
            "/backup/db1/notes.txt",
        ];
        for path in foreign {
            fs.add_file(path, ancient);
        }

        let result = sweep(
            &fs,
            Path::new("/backup/db1"),
            &naming(),
            &RetentionPolicy::from_days(1),
            NOW,
        )
        .expect("sweep");

        assert_eq!(result.examined, 0);
        for path in foreign {
            assert!(fs.has_file(Path::new(path)), "{} was touched", path);
        }
    }

    #[test]
    fn test_sweep_handles_plain_and_compressed() {
        let fs = MockFilesystem::new();
        let plain = archive("/b", NOW - 5 * DAY, false);
        let gz = archive("/b", NOW - 6 * DAY, true);
        fs.add_file(plain.clone(), NOW - 5 * DAY);
        fs.add_file(gz.clone(), NOW - 6 * DAY);

        let result = sweep(&fs, Path::new("/b"), &naming(), &RetentionPolicy::from_days(3), NOW)
            .expect("sweep");

        assert_eq!(result.removed.len(), 2);
        assert!(fs.paths().is_empty());
    }

    #[test]
    fn test_sweep_continues_after_delete_failure() {
        let fs = MockFilesystem::new();
        let stuck = archive("/b", NOW - 9 * DAY, true);
        let other = archive("/b", NOW - 8 * DAY, true);
        fs.add_file(stuck.clone(), NOW - 9 * DAY);
        fs.add_file(other.clone(), NOW - 8 * DAY);
        fs.fail_remove(stuck.clone());

        let result = sweep(&fs, Path::new("/b"), &naming(), &RetentionPolicy::from_days(3), NOW)
            .expect("sweep");

        assert_eq!(result.removed, vec![other.clone()]);
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, stuck);
        assert!(fs.has_file(&stuck));
        assert!(!fs.has_file(&other));
    }

    // ===========================================
    // remove_partials
    // ===========================================

    #[test]
    fn test_remove_partials_ignores_age_and_finished_archives() {
        let fs = MockFilesystem::new();
        let finished = archive("/b", NOW - 9 * DAY, true);
        let partial = crate::archive::partial_path(&archive("/b", NOW, true));
        let foreign = PathBuf::from("/b/other.tar.gz.partial");
        fs.add_file(finished.clone(), NOW - 9 * DAY);
        fs.add_file(partial.clone(), NOW);
        fs.add_file(foreign.clone(), NOW - 9 * DAY);

        let result = remove_partials(&fs, Path::new("/b"), &naming()).expect("remove");

        assert_eq!(result.examined, 1);
        assert_eq!(result.removed, vec![partial.clone()]);
        assert!(!fs.has_file(&partial));
        assert!(fs.has_file(&finished));
        assert!(fs.has_file(&foreign));
    }

    #[test]
    fn test_remove_partials_records_failures() {
        let fs = MockFilesystem::new();
        let partial = crate::archive::partial_path(&archive("/b", NOW, false));
        fs.add_file(partial.clone(), NOW);
        fs.fail_remove(partial.clone());

        let result = remove_partials(&fs, Path::new("/b"), &naming()).expect("remove");

        assert!(result.removed.is_empty());
        assert_eq!(result.failures.len(), 1);
        assert_eq!(result.failures[0].path, partial);
    }

    #[test]
    fn test_delete_failure_message() {
        let failure = RetentionDeleteFailed {
            path: PathBuf::from("/b/x.tar"),
            reason: "permission denied".to_string(),
        };
        assert_eq!(
            failure.to_string(),
            "failed to delete expired archive /b/x.tar: permission denied"
        );
    }
}
