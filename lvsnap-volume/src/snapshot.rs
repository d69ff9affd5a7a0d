//! Snapshot creation, lookup and removal.

use std::path::{Path, PathBuf};

use lvsnap_clock::Sleeper;

use crate::error::{VolumeError, VolumeResult};
use crate::query::VolumeQuery;
use crate::runner::{CommandRunner, CommandSpec};

/// Bounded retry of the device lookup after `lvcreate`.
///
/// Attempt `n` (1-based) is preceded by a sleep of `(n - 1) * backoff_ms`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LookupPolicy {
    pub attempts: u32,
    pub backoff_ms: u64,
}

impl Default for LookupPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            backoff_ms: 500,
        }
    }
}

/// A snapshot this run created or explicitly adopted.
///
/// Not `Clone`: removal consumes it.
#[derive(Debug, PartialEq, Eq)]
pub struct SnapshotHandle {
    name: String,
    volume_group: String,
    device_path: PathBuf,
}

impl SnapshotHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn volume_group(&self) -> &str {
        &self.volume_group
    }

    pub fn device_path(&self) -> &Path {
        &self.device_path
    }
}

/// What the volume manager currently reports under a snapshot name.
#[derive(Debug, Clone, PartialEq)]
pub enum SnapshotState {
    Missing,
    /// A volume with that name exists but is not a snapshot.
    NotSnapshot,
    Active { usage_percent: f64 },
}

/// Creates, finds and removes copy-on-write snapshots.
pub struct SnapshotManager<R: CommandRunner, S: Sleeper> {
    query: VolumeQuery<R>,
    sleeper: S,
    lookup: LookupPolicy,
}

impl<R: CommandRunner, S: Sleeper> SnapshotManager<R, S> {
    pub fn new(query: VolumeQuery<R>, sleeper: S, lookup: LookupPolicy) -> Self {
        Self {
            query,
            sleeper,
            lookup,
        }
    }

    /// Create a snapshot of `volume_group/source` named `name` and wait
    /// for its device to show up.
    pub fn create(
        &self,
        volume_group: &str,
        source: &str,
        name: &str,
        size_bytes: u64,
    ) -> VolumeResult<SnapshotHandle> {
        let spec = CommandSpec::new("lvcreate")
            .arg("--size")
            .arg(format!("{}b", size_bytes))
            .arg("--snapshot")
            .arg("--name")
            .arg(name)
            .arg(format!("{}/{}", volume_group, source));
        let output = self.query.runner().run(&spec)?;
        if !output.success() {
            return Err(VolumeError::SnapshotCreateFailed {
                name: name.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }

        self.locate(volume_group, name)
    }

    fn locate(&self, volume_group: &str, name: &str) -> VolumeResult<SnapshotHandle> {
        let attempts = self.lookup.attempts.max(1);
        for attempt in 0..attempts {
            if attempt > 0 {
                self.sleeper
                    .sleep_ms(self.lookup.backoff_ms.saturating_mul(u64::from(attempt)));
            }
            if let Some(lv) = self.query.find_member(volume_group, name)? {
                return Ok(SnapshotHandle {
                    name: lv.name,
                    volume_group: lv.volume_group,
                    device_path: lv.device_path,
                });
            }
        }
        Err(VolumeError::SnapshotNotFound {
            name: name.to_string(),
            volume_group: volume_group.to_string(),
            attempts,
        })
    }

    /// Current state of `name` in `volume_group`.
    pub fn inspect(&self, volume_group: &str, name: &str) -> VolumeResult<SnapshotState> {
        Ok(match self.query.find_member(volume_group, name)? {
            None => SnapshotState::Missing,
            Some(lv) => match lv.usage_percent {
                Some(usage_percent) => SnapshotState::Active { usage_percent },
                None => SnapshotState::NotSnapshot,
            },
        })
    }

    /// Handle for a leftover snapshot, if one exists under `name`.
    ///
    /// Volumes that are not snapshots are never adopted.
    pub fn adopt(&self, volume_group: &str, name: &str) -> VolumeResult<Option<SnapshotHandle>> {
        Ok(self
            .query
            .find_member(volume_group, name)?
            .filter(|lv| lv.is_snapshot())
            .map(|lv| SnapshotHandle {
                name: lv.name,
                volume_group: lv.volume_group,
                device_path: lv.device_path,
            }))
    }

    /// Remove the snapshot behind `handle`.
    ///
    /// Returns `Ok(false)` without touching anything when the name is gone
    /// or no longer refers to a snapshot.
    pub fn remove(&self, handle: SnapshotHandle) -> VolumeResult<bool> {
        self.remove_named(&handle.volume_group, &handle.name)
    }

    /// Idempotent removal by name, for snapshots without a handle.
    pub fn remove_named(&self, volume_group: &str, name: &str) -> VolumeResult<bool> {
        let device_path = match self.query.find_member(volume_group, name)? {
            Some(lv) if lv.is_snapshot() => lv.device_path,
            _ => return Ok(false),
        };

        let spec = CommandSpec::new("lvremove")
            .arg("-f")
            .arg(device_path.display().to_string());
        let output = self.query.runner().run(&spec)?;
        if !output.success() {
            return Err(VolumeError::SnapshotRemoveFailed {
                name: name.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr_text(),
            });
        }
        Ok(true)
    }
}
