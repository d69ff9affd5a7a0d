//! Snapshot backup lifecycle.
//!
//! `LifecycleController` drives one run through
//! `Idle → SpaceVerified → SnapshotCreated → Mounted → Archived → Unmounted →
//! SnapshotRemoved → RetentionSwept → Done`. Every acquired resource (the
//! snapshot, then its mount) is pushed on a cleanup stack; whatever happens
//! after `SnapshotCreated`, the stack is unwound in reverse order before the
//! run returns, and the first failure is the one reported.

use std::fmt;
use std::path::{Path, PathBuf};

use lvsnap_clock::{Clock, Sleeper};
use lvsnap_fs::{ArchiveArtifact, ArchiveError, ArchiveWriter, Filesystem, FsError, SweepResult};
use lvsnap_volume::{
    CapacityPlanner, CommandOutput, CommandRunner, CommandSpec, DiskUsage, MountController,
    MountHandle, RunnerError, SnapshotHandle, SnapshotManager, SnapshotState, VolumeError,
    VolumeQuery,
};
use thiserror::Error;

use crate::config::BackupConfig;
use crate::logger::Logger;
use crate::permissions::{normalize, PermissionReport};

/// Where a run is, or where it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Idle,
    SpaceVerified,
    SnapshotCreated,
    Mounted,
    Archived,
    Unmounted,
    SnapshotRemoved,
    RetentionSwept,
    Done,
    Aborting,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// A cleanup step that could not be completed.
#[derive(Debug, Error)]
pub enum CleanupFailure {
    #[error("failed to unmount {}: {source}", mount_point.display())]
    Unmount {
        mount_point: PathBuf,
        #[source]
        source: VolumeError,
    },

    #[error("failed to remove snapshot {name}: {source}")]
    RemoveSnapshot {
        name: String,
        #[source]
        source: VolumeError,
    },
}

/// Why a run failed.
#[derive(Debug, Error)]
pub enum BackupError {
    #[error("failed to prepare {}: {source}", path.display())]
    Prepare {
        path: PathBuf,
        #[source]
        source: FsError,
    },

    #[error("snapshot {volume_group}/{name} is left over from an earlier run (use --recover-stale to remove it)")]
    StaleSnapshot { name: String, volume_group: String },

    #[error("{volume_group}/{name} exists and is not a snapshot")]
    SnapshotNameTaken { name: String, volume_group: String },

    #[error("{} is already mounted (use --recover-stale to unmount it)", .0.display())]
    MountPointBusy(PathBuf),

    #[error("volume query failed: {0}")]
    Query(#[source] VolumeError),

    #[error("{0}")]
    Capacity(#[source] VolumeError),

    #[error("snapshot failed: {0}")]
    Snapshot(#[source] VolumeError),

    #[error("mount failed: {0}")]
    Mount(#[source] VolumeError),

    #[error("archive failed: {0}")]
    Archive(#[from] ArchiveError),

    #[error("cleanup failed: {0}")]
    Cleanup(#[source] CleanupFailure),
}

/// A failed run: the original error plus any cleanup failures behind it.
#[derive(Debug)]
pub struct RunFailure {
    pub error: BackupError,
    pub secondary: Vec<CleanupFailure>,
    /// Last stage reached before aborting.
    pub last_stage: Stage,
}

impl fmt::Display for RunFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)?;
        for failure in &self.secondary {
            write!(f, "; also {}", failure)?;
        }
        Ok(())
    }
}

impl std::error::Error for RunFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

/// Outcome of a successful run.
#[derive(Debug)]
pub struct BackupReport {
    pub volume_group: String,
    pub used_bytes: u64,
    pub snapshot_bytes: u64,
    pub archive: ArchiveArtifact,
    /// `None` when the archive directory could not be listed.
    pub permissions: Option<PermissionReport>,
    /// `None` when the archive directory could not be listed.
    pub sweep: Option<SweepResult>,
    pub warnings: Vec<String>,
}

/// Everything the controller talks to.
pub struct Collaborators<R, S, F, A, C, L> {
    pub runner: R,
    pub sleeper: S,
    pub fs: F,
    pub archiver: A,
    pub clock: C,
    pub logger: L,
}

enum Cleanup {
    RemoveSnapshot(SnapshotHandle),
    Unmount(MountHandle),
}

/// Runs one backup.
pub struct LifecycleController<'a, R, S, F, A, C, L>
where
    R: CommandRunner,
    S: Sleeper,
    F: Filesystem,
    A: ArchiveWriter,
    C: Clock,
    L: Logger,
{
    config: &'a BackupConfig,
    deps: Collaborators<R, S, F, A, C, L>,
    stages: Vec<Stage>,
    cleanup: Vec<Cleanup>,
    secondary: Vec<CleanupFailure>,
    warnings: Vec<String>,
}

impl<'a, R, S, F, A, C, L> LifecycleController<'a, R, S, F, A, C, L>
where
    R: CommandRunner,
    S: Sleeper,
    F: Filesystem,
    A: ArchiveWriter,
    C: Clock,
    L: Logger,
{
    pub fn new(config: &'a BackupConfig, deps: Collaborators<R, S, F, A, C, L>) -> Self {
        Self {
            config,
            deps,
            stages: vec![Stage::Idle],
            cleanup: Vec::new(),
            secondary: Vec::new(),
            warnings: Vec::new(),
        }
    }

    /// Stages entered so far, in order.
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn run(&mut self) -> Result<BackupReport, RunFailure> {
        let config = self.config;
        self.deps.logger.info(&format!(
            "backing up {} ({}) to {}",
            config.logical_volume,
            config.filesystem_mount.display(),
            config.host_backup_dir().display()
        ));

        match self.execute() {
            Ok(report) => {
                self.deps.logger.info(&format!(
                    "backup complete: {}",
                    report.archive.path.display()
                ));
                Ok(report)
            }
            Err(error) => Err(self.abort(error)),
        }
    }

    fn execute(&mut self) -> Result<BackupReport, BackupError> {
        let config = self.config;
        let started_at = self.deps.clock.now_unix_sec();
        let host_dir = config.host_backup_dir();

        let volume_group = self.prepare(&host_dir)?;

        // Space
        let used_bytes = DiskUsage::new(self.runner())
            .used_bytes(&config.filesystem_mount)
            .map_err(BackupError::Query)?;
        let info = self
            .query()
            .capacity(&volume_group)
            .map_err(BackupError::Query)?;
        let planner = CapacityPlanner::new();
        let plan = planner.plan(used_bytes, &info);
        planner
            .check_fits(&plan, &info)
            .map_err(BackupError::Capacity)?;
        self.deps.logger.info(&format!(
            "{} bytes used, {} free in {}; snapshot needs {}",
            used_bytes, info.free_bytes, volume_group, plan.required_bytes
        ));
        self.enter(Stage::SpaceVerified);

        // Snapshot
        let created = self.snapshots().create(
            &volume_group,
            &config.logical_volume,
            &config.snapshot_name,
            plan.required_bytes,
        );
        let snapshot = match created {
            Ok(handle) => handle,
            Err(e @ VolumeError::SnapshotNotFound { .. }) => {
                self.discard_unlocated(&volume_group);
                return Err(BackupError::Snapshot(e));
            }
            Err(e) => return Err(BackupError::Snapshot(e)),
        };
        let device = snapshot.device_path().to_path_buf();
        self.deps.logger.info(&format!(
            "snapshot {} created at {}",
            snapshot.name(),
            device.display()
        ));
        self.cleanup.push(Cleanup::RemoveSnapshot(snapshot));
        self.enter(Stage::SnapshotCreated);

        // Mount
        let mounted = self.mounts().mount(&device, config.mount_point());
        let mount = mounted.map_err(BackupError::Mount)?;
        self.deps.logger.info(&format!(
            "mounted {} on {}",
            device.display(),
            config.mount_point().display()
        ));
        self.cleanup.push(Cleanup::Unmount(mount));
        self.enter(Stage::Mounted);

        // Archive
        let destination = config.archive_path(started_at);
        self.deps
            .logger
            .debug(&format!("writing {}", destination.display()));
        let archive = self
            .deps
            .archiver
            .write(config.mount_point(), &destination, config.compress)?;
        for path in &archive.skipped {
            self.deps
                .logger
                .debug(&format!("skipped socket {}", path.display()));
        }
        self.deps
            .logger
            .info(&format!("archive written: {}", archive.path.display()));
        self.enter(Stage::Archived);

        // Release, then housekeeping. The archive is complete at this point,
        // so permissions and retention run even if release failed.
        let mut cleanup_failures = self.unwind().into_iter();
        let permissions = self.normalize_permissions(&host_dir);
        let sweep = self.sweep_expired(&host_dir);

        if let Some(first) = cleanup_failures.next() {
            self.secondary.extend(cleanup_failures);
            return Err(BackupError::Cleanup(first));
        }
        self.enter(Stage::Done);

        Ok(BackupReport {
            volume_group,
            used_bytes,
            snapshot_bytes: plan.required_bytes,
            archive,
            permissions,
            sweep,
            warnings: std::mem::take(&mut self.warnings),
        })
    }

    /// Create the working directories, find the volume group, and deal with
    /// anything a previous run left behind.
    fn prepare(&mut self, host_dir: &Path) -> Result<String, BackupError> {
        let config = self.config;
        for dir in [host_dir, config.mount_point()] {
            self.deps
                .fs
                .create_dir_all(dir)
                .map_err(|source| BackupError::Prepare {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        self.discard_partials(host_dir);

        let volume_group = self
            .query()
            .resolve_volume_group(&config.logical_volume)
            .map_err(BackupError::Query)?;

        self.clear_stale_mount()?;
        self.clear_stale_snapshot(&volume_group)?;
        Ok(volume_group)
    }

    /// Remove `.partial` archives an interrupted run left behind.
    fn discard_partials(&mut self, host_dir: &Path) {
        let config = self.config;
        match lvsnap_fs::remove_partials(&self.deps.fs, host_dir, &config.naming()) {
            Ok(result) => {
                for path in &result.removed {
                    self.warn(format!("removed unfinished archive {}", path.display()));
                }
                for failure in &result.failures {
                    self.warn(format!(
                        "failed to remove unfinished archive {}: {}",
                        failure.path.display(),
                        failure.reason
                    ));
                }
            }
            Err(e) => self.warn(format!("unfinished archive check skipped: {}", e)),
        }
    }

    fn clear_stale_mount(&mut self) -> Result<(), BackupError> {
        let config = self.config;
        let mount_point = config.mount_point();
        let busy = self
            .mounts()
            .is_mounted(mount_point)
            .map_err(BackupError::Mount)?;
        if !busy {
            return Ok(());
        }
        if !config.recover_stale {
            return Err(BackupError::MountPointBusy(mount_point.to_path_buf()));
        }

        let released = self.mounts().release_stale(mount_point);
        released.map_err(BackupError::Mount)?;
        self.warn(format!("unmounted stale mount on {}", mount_point.display()));
        Ok(())
    }

    fn clear_stale_snapshot(&mut self, volume_group: &str) -> Result<(), BackupError> {
        let config = self.config;
        let name = config.snapshot_name.as_str();
        let state = self
            .snapshots()
            .inspect(volume_group, name)
            .map_err(BackupError::Query)?;

        match state {
            SnapshotState::Missing => Ok(()),
            SnapshotState::NotSnapshot => Err(BackupError::SnapshotNameTaken {
                name: name.to_string(),
                volume_group: volume_group.to_string(),
            }),
            SnapshotState::Active { .. } if !config.recover_stale => {
                Err(BackupError::StaleSnapshot {
                    name: name.to_string(),
                    volume_group: volume_group.to_string(),
                })
            }
            SnapshotState::Active { usage_percent } => {
                let adopted = self.snapshots().adopt(volume_group, name);
                if let Some(handle) = adopted.map_err(BackupError::Snapshot)? {
                    let removed = self.snapshots().remove(handle);
                    removed.map_err(BackupError::Snapshot)?;
                }
                self.warn(format!(
                    "removed stale snapshot {}/{} ({:.2}% used)",
                    volume_group, name, usage_percent
                ));
                Ok(())
            }
        }
    }

    /// `lvcreate` succeeded but the device never showed up: remove the
    /// volume by name so it is not orphaned.
    fn discard_unlocated(&mut self, volume_group: &str) {
        let config = self.config;
        let name = config.snapshot_name.as_str();
        let removed = self.snapshots().remove_named(volume_group, name);
        match removed {
            Ok(true) => self
                .deps
                .logger
                .info(&format!("removed unlocated snapshot {}/{}", volume_group, name)),
            Ok(false) => self.warn(format!(
                "snapshot {}/{} could not be found for removal",
                volume_group, name
            )),
            Err(e) => self.warn(format!(
                "failed to remove unlocated snapshot {}/{}: {}",
                volume_group, name, e
            )),
        }
    }

    fn normalize_permissions(&mut self, host_dir: &Path) -> Option<PermissionReport> {
        let config = self.config;
        match normalize(&self.deps.fs, host_dir, config.archive_mode, config.archive_owner) {
            Ok(report) => {
                for failure in &report.failures {
                    self.warnings.push(failure.to_string());
                    self.deps.logger.warn(&failure.to_string());
                }
                self.deps.logger.debug(&format!(
                    "permissions set on {} file(s)",
                    report.updated.len()
                ));
                Some(report)
            }
            Err(e) => {
                self.warn(format!("permission update skipped: {}", e));
                None
            }
        }
    }

    fn sweep_expired(&mut self, host_dir: &Path) -> Option<SweepResult> {
        let config = self.config;
        let now = self.deps.clock.now_unix_sec();
        let swept = lvsnap_fs::sweep(
            &self.deps.fs,
            host_dir,
            &config.naming(),
            &config.retention_policy(),
            now,
        );
        match swept {
            Ok(result) => {
                for path in &result.removed {
                    self.deps
                        .logger
                        .info(&format!("removed expired archive {}", path.display()));
                }
                for failure in &result.failures {
                    self.warnings.push(failure.to_string());
                    self.deps.logger.warn(&failure.to_string());
                }
                self.enter(Stage::RetentionSwept);
                Some(result)
            }
            Err(e) => {
                self.warn(format!("retention sweep skipped: {}", e));
                None
            }
        }
    }

    /// Release everything on the cleanup stack, most recent first.
    fn unwind(&mut self) -> Vec<CleanupFailure> {
        let mut failures = Vec::new();

        while let Some(step) = self.cleanup.pop() {
            match step {
                Cleanup::Unmount(handle) => {
                    let mount_point = handle.mount_point().to_path_buf();
                    let unmounted = self.mounts().unmount(handle);
                    match unmounted {
                        Ok(()) => {
                            self.deps
                                .logger
                                .info(&format!("unmounted {}", mount_point.display()));
                            self.enter(Stage::Unmounted);
                        }
                        Err(source) => {
                            let failure = CleanupFailure::Unmount {
                                mount_point,
                                source,
                            };
                            self.deps.logger.warn(&failure.to_string());
                            failures.push(failure);
                        }
                    }
                }
                Cleanup::RemoveSnapshot(handle) => {
                    let name = handle.name().to_string();
                    let removed = self.snapshots().remove(handle);
                    match removed {
                        Ok(true) => {
                            self.deps
                                .logger
                                .info(&format!("snapshot {} removed", name));
                            self.enter(Stage::SnapshotRemoved);
                        }
                        Ok(false) => {
                            self.warn(format!("snapshot {} was already gone", name));
                            self.enter(Stage::SnapshotRemoved);
                        }
                        Err(source) => {
                            let failure = CleanupFailure::RemoveSnapshot { name, source };
                            self.deps.logger.warn(&failure.to_string());
                            failures.push(failure);
                        }
                    }
                }
            }
        }

        failures
    }

    fn abort(&mut self, error: BackupError) -> RunFailure {
        let last_stage = self
            .stages
            .iter()
            .rev()
            .copied()
            .find(|s| *s != Stage::Aborting)
            .unwrap_or(Stage::Idle);
        self.deps.logger.error(&error.to_string());

        self.enter(Stage::Aborting);
        let mut secondary = std::mem::take(&mut self.secondary);
        secondary.extend(self.unwind());

        RunFailure {
            error,
            secondary,
            last_stage,
        }
    }

    fn enter(&mut self, stage: Stage) {
        self.deps.logger.debug(&format!("stage: {}", stage));
        self.stages.push(stage);
    }

    fn warn(&mut self, message: String) {
        self.deps.logger.warn(&message);
        self.warnings.push(message);
    }

    fn runner(&self) -> LoggedRunner<'_, R, L> {
        LoggedRunner {
            inner: &self.deps.runner,
            logger: &self.deps.logger,
        }
    }

    fn query(&self) -> VolumeQuery<LoggedRunner<'_, R, L>> {
        VolumeQuery::new(self.runner())
    }

    fn snapshots(&self) -> SnapshotManager<LoggedRunner<'_, R, L>, &S> {
        SnapshotManager::new(self.query(), &self.deps.sleeper, self.config.lookup)
    }

    fn mounts(&self) -> MountController<LoggedRunner<'_, R, L>, &F> {
        MountController::new(
            self.runner(),
            &self.deps.fs,
            self.config.mount_options.clone(),
        )
    }
}

/// Logs every external command at debug level.
struct LoggedRunner<'a, R, L> {
    inner: &'a R,
    logger: &'a L,
}

impl<'a, R: CommandRunner, L: Logger> CommandRunner for LoggedRunner<'a, R, L> {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        self.logger.debug(&format!("running: {}", spec));
        let result = self.inner.run(spec);
        match &result {
            Ok(output) if !output.success() => self.logger.debug(&format!(
                "{} exited with status {}: {}",
                spec.program,
                output.exit_code,
                output.stderr_text()
            )),
            Err(e) => self.logger.debug(&e.to_string()),
            Ok(_) => {}
        }
        result
    }
}
