//! Archive file naming.
//!
//! Archives are named `<hostname><fs_path>.<YYYY-mm-dd:HH:MM:SS>.tar[.gz]`
//! where every `/` in the source filesystem path becomes `_`, e.g.
//! `db1_data.2024-01-01:00:00:00.tar.gz` for `/data` on host `db1`.
//! The retention sweep only ever touches names this module recognizes for
//! the current host and filesystem.

use std::path::Path;

use chrono::{NaiveDateTime, TimeZone, Utc};

use crate::archive::PARTIAL_SUFFIX;

/// Timestamp layout embedded in archive names (UTC).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d:%H:%M:%S";

const TAR_EXT: &str = ".tar";
const TAR_GZ_EXT: &str = ".tar.gz";

/// Format a Unix timestamp the way archive names carry it.
pub fn format_timestamp(ts_unix: u64) -> String {
    Utc.timestamp_opt(ts_unix as i64, 0)
        .single()
        .map(|dt| dt.format(TIMESTAMP_FORMAT).to_string())
        .unwrap_or_else(|| ts_unix.to_string())
}

/// Parse an archive-name timestamp back into Unix seconds.
pub fn parse_timestamp(stamp: &str) -> Option<u64> {
    let naive = NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).ok()?;
    u64::try_from(naive.and_utc().timestamp()).ok()
}

/// Naming scheme for one host/filesystem pair.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveNaming {
    prefix: String,
}

impl ArchiveNaming {
    pub fn new(hostname: &str, filesystem: &Path) -> Self {
        let fs_part = filesystem.to_string_lossy().replace('/', "_");
        Self {
            prefix: format!("{}{}", hostname, fs_part),
        }
    }

    /// `<hostname><fs_path>`, the part shared by every archive of this pair.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn file_name(&self, ts_unix: u64, compressed: bool) -> String {
        let ext = if compressed { TAR_GZ_EXT } else { TAR_EXT };
        format!("{}.{}{}", self.prefix, format_timestamp(ts_unix), ext)
    }

    /// Timestamp encoded in `file_name` if it belongs to this host/filesystem.
    pub fn parse(&self, file_name: &str) -> Option<u64> {
        let rest = file_name.strip_prefix(&self.prefix)?.strip_prefix('.')?;
        let stamp = rest
            .strip_suffix(TAR_GZ_EXT)
            .or_else(|| rest.strip_suffix(TAR_EXT))?;
        parse_timestamp(stamp)
    }

    pub fn matches(&self, file_name: &str) -> bool {
        self.parse(file_name).is_some()
    }

    /// `file_name` is an unfinished archive of this host/filesystem.
    pub fn matches_partial(&self, file_name: &str) -> bool {
        file_name
            .strip_suffix(PARTIAL_SUFFIX)
            .map_or(false, |name| self.matches(name))
    }
}
