//! Run configuration.
//!
//! `BackupConfig` is the validated, fully-resolved form of the command line.
//! The lifecycle controller only ever sees this struct.

use std::path::{Path, PathBuf};

use lvsnap_fs::{ArchiveNaming, RetentionPolicy};
use lvsnap_volume::{LookupPolicy, MountOptions};

use crate::cli::{parse_mode, parse_owner, Cli, CliError};
use crate::logger::Level;

/// Name of the log file inside the log directory.
pub const LOG_FILE_NAME: &str = "lvsnap.log";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupConfig {
    pub hostname: String,
    pub backup_dir: PathBuf,
    pub filesystem_mount: PathBuf,
    pub logical_volume: String,
    pub snapshot_name: String,
    pub snapshot_mount_point: PathBuf,
    pub retention_days: u64,
    pub compress: bool,
    pub command_timeout_secs: u64,
    pub lookup: LookupPolicy,
    pub mount_options: MountOptions,
    pub archive_mode: u32,
    pub archive_owner: Option<(u32, u32)>,
    pub recover_stale: bool,
    pub log_dir: PathBuf,
    pub lock_dir: PathBuf,
    pub log_level: Level,
}

impl BackupConfig {
    /// Validate `cli` and resolve it against the local `hostname`.
    pub fn from_cli(cli: &Cli, hostname: &str) -> Result<Self, CliError> {
        cli.validate()?;

        Ok(Self {
            hostname: hostname.to_string(),
            backup_dir: cli.backup_dir.clone(),
            filesystem_mount: cli.file_system.clone(),
            logical_volume: cli.logical_volume.clone(),
            snapshot_name: cli.snap_name.clone(),
            snapshot_mount_point: cli.mount.clone(),
            retention_days: cli.retention_days,
            compress: cli.compress,
            command_timeout_secs: cli.timeout_sec,
            lookup: LookupPolicy {
                attempts: cli.lookup_attempts,
                backoff_ms: cli.lookup_backoff_ms,
            },
            mount_options: MountOptions {
                bypass_duplicate_uuid: !cli.no_uuid_bypass,
                extra: cli.mount_options.clone(),
            },
            archive_mode: parse_mode(&cli.archive_mode)?,
            archive_owner: cli.archive_owner.as_deref().map(parse_owner).transpose()?,
            recover_stale: cli.recover_stale,
            log_dir: cli.log_dir.clone(),
            lock_dir: cli.lock_dir.clone(),
            log_level: Level::from_verbosity(cli.verbose),
        })
    }

    /// `<backup_dir>/<hostname>`, where this host's archives live.
    pub fn host_backup_dir(&self) -> PathBuf {
        self.backup_dir.join(&self.hostname)
    }

    pub fn naming(&self) -> ArchiveNaming {
        ArchiveNaming::new(&self.hostname, &self.filesystem_mount)
    }

    pub fn retention_policy(&self) -> RetentionPolicy {
        RetentionPolicy::from_days(self.retention_days)
    }

    /// Full path of the archive for a run started at `ts_unix`.
    pub fn archive_path(&self, ts_unix: u64) -> PathBuf {
        self.host_backup_dir()
            .join(self.naming().file_name(ts_unix, self.compress))
    }

    pub fn log_path(&self) -> PathBuf {
        self.log_dir.join(LOG_FILE_NAME)
    }

    /// Lock file serializing runs that share a snapshot name.
    pub fn lock_path(&self) -> PathBuf {
        self.lock_dir.join(format!("{}.lock", self.snapshot_name))
    }

    pub fn mount_point(&self) -> &Path {
        &self.snapshot_mount_point
    }
}
