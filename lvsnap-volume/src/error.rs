//! Errors from volume and mount operations.

use std::path::PathBuf;

use lvsnap_fs::FsError;
use thiserror::Error;

use crate::runner::{CommandOutput, CommandSpec, RunnerError};

/// Errors from volume manager and mount tooling.
#[derive(Debug, Error)]
pub enum VolumeError {
    /// The tool could not be started or ran past its timeout.
    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("`{command}` exited with status {exit_code}: {stderr}")]
    VolumeManager {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("unexpected output from `{command}`: {detail}")]
    Parse { command: String, detail: String },

    #[error("logical volume {0} not found")]
    VolumeNotFound(String),

    #[error("insufficient space for snapshot: {available} bytes free, {required} bytes required")]
    InsufficientSpace { available: u64, required: u64 },

    #[error("failed to create snapshot {name} (status {exit_code}): {stderr}")]
    SnapshotCreateFailed {
        name: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("snapshot {name} did not appear in volume group {volume_group} after {attempts} lookups")]
    SnapshotNotFound {
        name: String,
        volume_group: String,
        attempts: u32,
    },

    #[error("failed to remove snapshot {name} (status {exit_code}): {stderr}")]
    SnapshotRemoveFailed {
        name: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to mount {} (status {exit_code}): {stderr}", device.display())]
    MountFailed {
        device: PathBuf,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to unmount {} (status {exit_code}): {stderr}", mount_point.display())]
    UnmountFailed {
        mount_point: PathBuf,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to prepare mount point: {0}")]
    MountPoint(#[source] FsError),
}

pub type VolumeResult<T> = Result<T, VolumeError>;

impl VolumeError {
    /// Non-zero exit of a query-style command.
    pub(crate) fn manager(spec: &CommandSpec, output: &CommandOutput) -> Self {
        VolumeError::VolumeManager {
            command: spec.command_line(),
            exit_code: output.exit_code,
            stderr: output.stderr_text(),
        }
    }

    pub(crate) fn parse(spec: &CommandSpec, detail: impl Into<String>) -> Self {
        VolumeError::Parse {
            command: spec.command_line(),
            detail: detail.into(),
        }
    }

    /// True when the tool timed out rather than reporting a failure.
    pub fn is_timeout(&self) -> bool {
        matches!(self, VolumeError::Runner(RunnerError::Timeout { .. }))
    }
}

/// Run `spec` and turn a non-zero exit into `VolumeError::VolumeManager`.
pub(crate) fn run_checked<R: crate::runner::CommandRunner>(
    runner: &R,
    spec: &CommandSpec,
) -> VolumeResult<CommandOutput> {
    let output = runner.run(spec)?;
    if !output.success() {
        return Err(VolumeError::manager(spec, &output));
    }
    Ok(output)
}
