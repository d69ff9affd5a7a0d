//! LVM and mount tooling for lvsnap.
//!
//! This crate provides:
//! - `CommandRunner` for blocking, time-bounded external tool invocation
//!   (system, scripted mock and a stateful fake host)
//! - Output parsing for `lvs` / `vgs` / `du`
//! - `VolumeQuery`, `CapacityPlanner`, `SnapshotManager`, `MountController`
//!
//! Each tool's syntax is confined to the module that invokes it; callers only
//! see parsed structs.

pub mod capacity;
pub mod error;
pub mod fake;
pub mod mount;
pub mod parse;
pub mod query;
pub mod runner;
pub mod snapshot;
pub mod usage;

pub use capacity::{required_bytes, CapacityPlan, CapacityPlanner, MIN_SNAPSHOT_BYTES};
pub use error::{VolumeError, VolumeResult};
pub use fake::FakeVolumeHost;
pub use mount::{MountController, MountHandle, MountOptions, UUID_BYPASS_OPTION};
pub use query::{LogicalVolume, VolumeInfo, VolumeQuery};
pub use runner::{
    CommandOutput, CommandRunner, CommandSpec, MockRunner, RunnerError, SystemRunner,
    DEFAULT_TIMEOUT_SECS,
};
pub use snapshot::{LookupPolicy, SnapshotHandle, SnapshotManager, SnapshotState};
pub use usage::DiskUsage;
