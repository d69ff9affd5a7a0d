//! Filesystem side of lvsnap.
//!
//! This crate provides:
//! - `Filesystem` trait (real and mock) for directory setup, listing with
//!   modification times, removal and permission changes
//! - Archive naming: `<host><fs_path>.<timestamp>.tar[.gz]`
//! - `ArchiveWriter` producing tar / tar.gz archives of a mounted snapshot
//! - Retention sweep of expired archives

pub mod archive;
pub mod fs;
pub mod naming;
pub mod retention;

pub use archive::{
    partial_path, ArchiveArtifact, PARTIAL_SUFFIX, ArchiveError, ArchiveRequest, ArchiveWriter, MockArchiveWriter,
    TarArchiveWriter,
};
pub use fs::{FileEntry, Filesystem, FsError, MockFile, MockFilesystem, RealFilesystem};
pub use naming::{format_timestamp, parse_timestamp, ArchiveNaming, TIMESTAMP_FORMAT};
pub use retention::{remove_partials, sweep, RetentionDeleteFailed, RetentionPolicy, SweepResult};
