//! Snapshot sizing and the space pre-check.

use crate::error::{VolumeError, VolumeResult};
use crate::query::VolumeInfo;

/// Smallest snapshot ever requested; LVM rounds smaller sizes up to an
/// extent anyway.
pub const MIN_SNAPSHOT_BYTES: u64 = 4 * 1024 * 1024;

/// Headroom over the used bytes of the source, as a ratio.
const HEADROOM_NUM: u128 = 6;
const HEADROOM_DEN: u128 = 5;

/// Bytes to reserve for a snapshot of a volume with `used_bytes` in use:
/// 1.2 × used, rounded up, at least `MIN_SNAPSHOT_BYTES`.
pub fn required_bytes(used_bytes: u64) -> u64 {
    let scaled = (used_bytes as u128 * HEADROOM_NUM + HEADROOM_DEN - 1) / HEADROOM_DEN;
    u64::try_from(scaled)
        .unwrap_or(u64::MAX)
        .max(MIN_SNAPSHOT_BYTES)
}

/// Snapshot size chosen for a volume group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapacityPlan {
    pub volume_group: String,
    pub used_bytes: u64,
    pub required_bytes: u64,
}

/// Sizes a snapshot and checks it against the group's free space.
///
/// Advisory only: `lvcreate` can still fail if the group changes between
/// the check and the create.
#[derive(Debug, Clone, Copy, Default)]
pub struct CapacityPlanner;

impl CapacityPlanner {
    pub fn new() -> Self {
        Self
    }

    pub fn plan(&self, used_bytes: u64, info: &VolumeInfo) -> CapacityPlan {
        CapacityPlan {
            volume_group: info.volume_group.clone(),
            used_bytes,
            required_bytes: required_bytes(used_bytes),
        }
    }

    /// Free bytes are compared directly against the planned size.
    pub fn check_fits(&self, plan: &CapacityPlan, info: &VolumeInfo) -> VolumeResult<()> {
        if info.free_bytes < plan.required_bytes {
            return Err(VolumeError::InsufficientSpace {
                available: info.free_bytes,
                required: plan.required_bytes,
            });
        }
        Ok(())
    }
}
