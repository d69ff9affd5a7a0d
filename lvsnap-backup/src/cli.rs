//! CLI argument parsing for lvsnap.
//!
//! Defaults reproduce the historical backup script: snapshot `lv_data`
//! mounted at `/data`, archive into `/backup/<hostname>/`, keep three days.

use std::path::PathBuf;

use clap::Parser;
use lvsnap_volume::DEFAULT_TIMEOUT_SECS;
use thiserror::Error;

/// Default root for archives; one subdirectory per host.
pub const DEFAULT_BACKUP_DIR: &str = "/backup";

pub const DEFAULT_FILE_SYSTEM: &str = "/data";

pub const DEFAULT_LOGICAL_VOLUME: &str = "lv_data";

/// Default mount point for the snapshot while it is archived.
pub const DEFAULT_MOUNT_POINT: &str = "/tmp/snap_backup";

pub const DEFAULT_RETENTION_DAYS: u64 = 3;

pub const DEFAULT_SNAPSHOT_NAME: &str = "lv_data_snap";

pub const DEFAULT_LOG_DIR: &str = "/var/log/lvsnap";

pub const DEFAULT_LOCK_DIR: &str = "/run/lvsnap";

pub const DEFAULT_LOOKUP_ATTEMPTS: u32 = 5;

pub const DEFAULT_LOOKUP_BACKOFF_MS: u64 = 500;

/// Permission bits applied to archives, as octal text.
pub const DEFAULT_ARCHIVE_MODE: &str = "774";

/// Errors from CLI argument validation.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CliError {
    #[error("retention-days must be at least 1, got {0}")]
    InvalidRetentionDays(u64),

    #[error("snap-name must be a plain volume name, got {0:?}")]
    InvalidSnapshotName(String),

    #[error("logical-volume must not be empty")]
    EmptyLogicalVolume,

    #[error("snap-name must differ from logical-volume {0:?}")]
    SnapshotNameIsSource(String),

    #[error("mount point {0} is the source file system")]
    MountPointIsSource(PathBuf),

    #[error("timeout-sec must be at least 1, got {0}")]
    InvalidTimeout(u64),

    #[error("lookup-attempts must be at least 1, got {0}")]
    InvalidLookupAttempts(u32),

    #[error("archive-mode must be octal permission bits, got {0:?}")]
    InvalidArchiveMode(String),

    #[error("archive-owner must be <uid>:<gid>, got {0:?}")]
    InvalidArchiveOwner(String),
}

/// lvsnap - back up a live file system through an LVM snapshot.
#[derive(Parser, Debug, Clone, PartialEq, Eq)]
#[command(name = "lvsnap")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Root directory for archives; a per-host subdirectory is used.
    #[arg(short = 'b', long, default_value = DEFAULT_BACKUP_DIR)]
    pub backup_dir: PathBuf,

    /// Gzip-compress the archive.
    #[arg(short = 'c', long)]
    pub compress: bool,

    /// Mount point of the file system being backed up.
    #[arg(short = 'f', long = "file-system", default_value = DEFAULT_FILE_SYSTEM)]
    pub file_system: PathBuf,

    /// Logical volume backing the file system.
    #[arg(short = 'l', long, default_value = DEFAULT_LOGICAL_VOLUME)]
    pub logical_volume: String,

    /// Where the snapshot is mounted while it is archived.
    #[arg(short = 'm', long = "mount", default_value = DEFAULT_MOUNT_POINT)]
    pub mount: PathBuf,

    /// Delete this host's archives older than this many days.
    #[arg(short = 'r', long, default_value_t = DEFAULT_RETENTION_DAYS)]
    pub retention_days: u64,

    /// Name of the snapshot logical volume.
    #[arg(short = 's', long = "snap-name", default_value = DEFAULT_SNAPSHOT_NAME)]
    pub snap_name: String,

    /// Directory for the run log (lvsnap.log).
    #[arg(long, default_value = DEFAULT_LOG_DIR)]
    pub log_dir: PathBuf,

    /// Log debug detail (external commands and their output).
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Kill any external command that runs longer than this.
    #[arg(long = "timeout-sec", default_value_t = DEFAULT_TIMEOUT_SECS)]
    pub timeout_sec: u64,

    /// How many times to look for the snapshot device after creating it.
    #[arg(long, default_value_t = DEFAULT_LOOKUP_ATTEMPTS)]
    pub lookup_attempts: u32,

    /// Backoff step between device lookups; grows linearly.
    #[arg(long, default_value_t = DEFAULT_LOOKUP_BACKOFF_MS)]
    pub lookup_backoff_ms: u64,

    /// Do not pass `nouuid` when mounting (needed for ext4).
    #[arg(long)]
    pub no_uuid_bypass: bool,

    /// Extra mount option for the snapshot; may be repeated.
    #[arg(long = "mount-option", value_name = "OPT")]
    pub mount_options: Vec<String>,

    /// Octal permission bits applied to archives.
    #[arg(long, default_value = DEFAULT_ARCHIVE_MODE)]
    pub archive_mode: String,

    /// Owner applied to archives, as numeric uid:gid.
    #[arg(long, value_name = "UID:GID")]
    pub archive_owner: Option<String>,

    /// Remove a leftover snapshot or mount from an earlier run instead of
    /// refusing to start.
    #[arg(long)]
    pub recover_stale: bool,

    /// Directory for the run lock.
    #[arg(long, default_value = DEFAULT_LOCK_DIR)]
    pub lock_dir: PathBuf,
}

impl Cli {
    /// Validate the arguments.
    pub fn validate(&self) -> Result<(), CliError> {
        if self.retention_days == 0 {
            return Err(CliError::InvalidRetentionDays(self.retention_days));
        }
        if self.logical_volume.trim().is_empty() {
            return Err(CliError::EmptyLogicalVolume);
        }
        if self.snap_name.trim().is_empty() || self.snap_name.contains('/') {
            return Err(CliError::InvalidSnapshotName(self.snap_name.clone()));
        }
        if self.snap_name == self.logical_volume {
            return Err(CliError::SnapshotNameIsSource(self.snap_name.clone()));
        }
        if self.mount == self.file_system {
            return Err(CliError::MountPointIsSource(self.mount.clone()));
        }
        if self.timeout_sec == 0 {
            return Err(CliError::InvalidTimeout(self.timeout_sec));
        }
        if self.lookup_attempts == 0 {
            return Err(CliError::InvalidLookupAttempts(self.lookup_attempts));
        }
        parse_mode(&self.archive_mode)?;
        if let Some(owner) = &self.archive_owner {
            parse_owner(owner)?;
        }
        Ok(())
    }
}

/// Parse octal permission bits such as `774` or `0640`.
pub fn parse_mode(raw: &str) -> Result<u32, CliError> {
    let invalid = || CliError::InvalidArchiveMode(raw.to_string());
    let digits = raw.trim();
    if digits.is_empty() {
        return Err(invalid());
    }
    let mode = u32::from_str_radix(digits, 8).map_err(|_| invalid())?;
    if mode > 0o7777 {
        return Err(invalid());
    }
    Ok(mode)
}

/// Parse a numeric `uid:gid` pair.
pub fn parse_owner(raw: &str) -> Result<(u32, u32), CliError> {
    let invalid = || CliError::InvalidArchiveOwner(raw.to_string());
    let (uid, gid) = raw.split_once(':').ok_or_else(invalid)?;
    let uid = uid.trim().parse().map_err(|_| invalid())?;
    let gid = gid.trim().parse().map_err(|_| invalid())?;
    Ok((uid, gid))
}

/// Parse CLI arguments from an iterator of strings.
/// Useful for testing.
pub fn parse_from<I, T>(iter: I) -> Result<Cli, clap::Error>
where
    I: IntoIterator<Item = T>,
    T: Into<std::ffi::OsString> + Clone,
{
    Cli::try_parse_from(iter)
}
