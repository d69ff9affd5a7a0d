//! Exit codes for the lvsnap CLI.
//!
//! Each failure class has its own code so a scheduler can tell a full
//! volume group from a stuck mount without parsing logs.

use crate::lifecycle::BackupError;
use crate::lock::LockError;
use crate::CommandError;

/// Exit code constants.
pub mod codes {
    /// Successful execution.
    pub const SUCCESS: i32 = 0;
    /// Invalid arguments.
    pub const INVALID_ARGS: i32 = 1;
    /// IO or setup error.
    pub const IO_ERROR: i32 = 2;
    /// Not enough free space in the volume group.
    pub const INSUFFICIENT_SPACE: i32 = 3;
    /// Volume query error.
    pub const VOLUME_QUERY: i32 = 4;
    /// Snapshot create or remove error.
    pub const SNAPSHOT_ERROR: i32 = 5;
    /// Mount error.
    pub const MOUNT_ERROR: i32 = 6;
    /// Archive error.
    pub const ARCHIVE_ERROR: i32 = 7;
    /// Archive written but the snapshot or mount could not be released.
    pub const CLEANUP_ERROR: i32 = 8;
    /// Another run holds the lock.
    pub const LOCKED: i32 = 9;
}

/// Map a CommandError to an exit code.
pub fn exit_code(error: &CommandError) -> i32 {
    match error {
        CommandError::InvalidArgument(_) => codes::INVALID_ARGS,
        CommandError::Hostname(_) => codes::IO_ERROR,
        CommandError::Lock(LockError::Held { .. }) => codes::LOCKED,
        CommandError::Lock(LockError::Io { .. }) => codes::IO_ERROR,
        CommandError::Run(failure) => backup_exit_code(&failure.error),
    }
}

/// Map the primary error of a failed run to an exit code.
pub fn backup_exit_code(error: &BackupError) -> i32 {
    match error {
        BackupError::Prepare { .. } => codes::IO_ERROR,
        BackupError::Query(_) => codes::VOLUME_QUERY,
        BackupError::Capacity(_) => codes::INSUFFICIENT_SPACE,
        BackupError::StaleSnapshot { .. }
        | BackupError::SnapshotNameTaken { .. }
        | BackupError::Snapshot(_) => codes::SNAPSHOT_ERROR,
        BackupError::MountPointBusy(_) | BackupError::Mount(_) => codes::MOUNT_ERROR,
        BackupError::Archive(_) => codes::ARCHIVE_ERROR,
        BackupError::Cleanup(_) => codes::CLEANUP_ERROR,
    }
}
