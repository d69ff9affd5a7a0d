//! Mounting and unmounting the snapshot device.

use std::path::{Path, PathBuf};

use lvsnap_fs::Filesystem;

use crate::error::{VolumeError, VolumeResult};
use crate::runner::{CommandRunner, CommandSpec};

/// Mount option that lets XFS mount a snapshot carrying the same UUID as
/// its still-mounted origin.
pub const UUID_BYPASS_OPTION: &str = "nouuid";

/// Options passed to `mount -o`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountOptions {
    /// Add `nouuid`. ext4 refuses the option, so it can be turned off.
    pub bypass_duplicate_uuid: bool,
    pub extra: Vec<String>,
}

impl Default for MountOptions {
    fn default() -> Self {
        Self {
            bypass_duplicate_uuid: true,
            extra: Vec::new(),
        }
    }
}

impl MountOptions {
    /// Comma-joined option list, or `None` when there is nothing to pass.
    pub fn option_string(&self) -> Option<String> {
        let mut opts: Vec<&str> = Vec::new();
        if self.bypass_duplicate_uuid {
            opts.push(UUID_BYPASS_OPTION);
        }
        opts.extend(
            self.extra
                .iter()
                .map(String::as_str)
                .filter(|o| !o.is_empty() && *o != UUID_BYPASS_OPTION),
        );
        if opts.is_empty() {
            None
        } else {
            Some(opts.join(","))
        }
    }
}

/// An active mount made by this run. Consumed by `unmount`.
#[derive(Debug, PartialEq, Eq)]
pub struct MountHandle {
    device_path: PathBuf,
    mount_point: PathBuf,
}

impl MountHandle {
    pub fn device_path(&self) -> &Path {
        &self.device_path
    }

    pub fn mount_point(&self) -> &Path {
        &self.mount_point
    }
}

/// Runs `mount`, `umount` and `mountpoint`.
pub struct MountController<R: CommandRunner, F: Filesystem> {
    runner: R,
    fs: F,
    options: MountOptions,
}

impl<R: CommandRunner, F: Filesystem> MountController<R, F> {
    pub fn new(runner: R, fs: F, options: MountOptions) -> Self {
        Self {
            runner,
            fs,
            options,
        }
    }

    /// Mount `device` on `mount_point`, creating the directory first.
    pub fn mount(&self, device: &Path, mount_point: &Path) -> VolumeResult<MountHandle> {
        self.fs
            .create_dir_all(mount_point)
            .map_err(VolumeError::MountPoint)?;

        let mut spec = CommandSpec::new("mount");
        if let Some(opts) = self.options.option_string() {
            spec = spec.arg("-o").arg(opts);
        }
        let spec = spec
            .arg(device.display().to_string())
            .arg(mount_point.display().to_string());

        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(VolumeError::MountFailed {
                device: device.to_path_buf(),
                exit_code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }

        Ok(MountHandle {
            device_path: device.to_path_buf(),
            mount_point: mount_point.to_path_buf(),
        })
    }

    /// Unmount a mount made by `mount`.
    pub fn unmount(&self, handle: MountHandle) -> VolumeResult<()> {
        self.umount(&handle.mount_point)
    }

    /// Whether anything is mounted on `path`.
    pub fn is_mounted(&self, path: &Path) -> VolumeResult<bool> {
        let spec = CommandSpec::new("mountpoint")
            .arg("-q")
            .arg(path.display().to_string());
        Ok(self.runner.run(&spec)?.success())
    }

    /// Unmount whatever a previous run left on `path`.
    /// Returns `false` when nothing was mounted.
    pub fn release_stale(&self, path: &Path) -> VolumeResult<bool> {
        if !self.is_mounted(path)? {
            return Ok(false);
        }
        self.umount(path)?;
        Ok(true)
    }

    fn umount(&self, mount_point: &Path) -> VolumeResult<()> {
        let spec = CommandSpec::new("umount").arg(mount_point.display().to_string());
        let output = self.runner.run(&spec)?;
        if !output.success() {
            return Err(VolumeError::UnmountFailed {
                mount_point: mount_point.to_path_buf(),
                exit_code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(())
    }
}
