//! Volume manager queries.

use std::path::PathBuf;

use crate::error::{run_checked, VolumeError, VolumeResult};
use crate::parse::{data_rows, parse_percent, parse_size};
use crate::runner::{CommandRunner, CommandSpec};

/// Capacity of the volume group backing a logical volume.
///
/// Both sizes come from a single `vgs` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub volume_group: String,
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// One row of a volume group's member listing.
#[derive(Debug, Clone, PartialEq)]
pub struct LogicalVolume {
    pub name: String,
    pub volume_group: String,
    pub device_path: PathBuf,
    pub size_bytes: u64,
    /// Copy-on-write usage; only snapshots report one.
    pub usage_percent: Option<f64>,
}

impl LogicalVolume {
    pub fn is_snapshot(&self) -> bool {
        self.usage_percent.is_some()
    }
}

/// Read-only queries against the volume manager.
#[derive(Debug, Clone)]
pub struct VolumeQuery<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> VolumeQuery<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// Name of the volume group containing `logical_volume`.
    pub fn resolve_volume_group(&self, logical_volume: &str) -> VolumeResult<String> {
        let spec = CommandSpec::new("lvs").args([
            "--noheadings",
            "--separator",
            ",",
            "-o",
            "lv_name,vg_name",
        ]);
        let output = run_checked(&self.runner, &spec)?;

        data_rows(&output.stdout)
            .into_iter()
            .find(|row| row.len() >= 2 && row[0] == logical_volume)
            .map(|row| row[1].clone())
            .ok_or_else(|| VolumeError::VolumeNotFound(logical_volume.to_string()))
    }

    /// Total and free bytes of `volume_group`.
    pub fn capacity(&self, volume_group: &str) -> VolumeResult<VolumeInfo> {
        let spec = CommandSpec::new("vgs").args([
            "--noheadings",
            "--units",
            "b",
            "--separator",
            ",",
            "-o",
            "vg_name,vg_size,vg_free",
            volume_group,
        ]);
        let output = run_checked(&self.runner, &spec)?;

        let row = data_rows(&output.stdout)
            .into_iter()
            .find(|row| row.len() >= 3 && row[0] == volume_group)
            .ok_or_else(|| VolumeError::parse(&spec, format!("no row for volume group {}", volume_group)))?;

        let total_bytes = parse_size(&row[1])
            .ok_or_else(|| VolumeError::parse(&spec, format!("bad vg_size {:?}", row[1])))?;
        let free_bytes = parse_size(&row[2])
            .ok_or_else(|| VolumeError::parse(&spec, format!("bad vg_free {:?}", row[2])))?;

        Ok(VolumeInfo {
            name: row[0].clone(),
            volume_group: volume_group.to_string(),
            total_bytes,
            free_bytes,
        })
    }

    /// All logical volumes of `volume_group`, snapshots included.
    pub fn members(&self, volume_group: &str) -> VolumeResult<Vec<LogicalVolume>> {
        let spec = CommandSpec::new("lvs").args([
            "--noheadings",
            "--units",
            "b",
            "--separator",
            ",",
            "-o",
            "lv_name,vg_name,lv_path,lv_size,snap_percent",
            volume_group,
        ]);
        let output = run_checked(&self.runner, &spec)?;

        let mut volumes = Vec::new();
        for row in data_rows(&output.stdout) {
            if row.len() < 4 {
                return Err(VolumeError::parse(&spec, format!("short row {:?}", row)));
            }
            let size_bytes = parse_size(&row[3])
                .ok_or_else(|| VolumeError::parse(&spec, format!("bad lv_size {:?}", row[3])))?;
            // Inactive volumes report an empty lv_path.
            let device_path = if row[2].is_empty() {
                PathBuf::from(format!("/dev/{}/{}", row[1], row[0]))
            } else {
                PathBuf::from(&row[2])
            };
            volumes.push(LogicalVolume {
                name: row[0].clone(),
                volume_group: row[1].clone(),
                device_path,
                size_bytes,
                usage_percent: row.get(4).and_then(|p| parse_percent(p)),
            });
        }
        Ok(volumes)
    }

    /// The member named `name`, if present.
    pub fn find_member(&self, volume_group: &str, name: &str) -> VolumeResult<Option<LogicalVolume>> {
        Ok(self
            .members(volume_group)?
            .into_iter()
            .find(|lv| lv.name == name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockRunner};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn query(runner: &MockRunner) -> VolumeQuery<&MockRunner> {
        VolumeQuery::new(runner)
    }

    // ===========================================
    // resolve_volume_group
    // ===========================================

    #[test]
    fn test_resolve_volume_group() {
        let runner = MockRunner::new();
        runner.on(
            "lvs",
            CommandOutput::ok("  lv_root,vg_sys\n  lv_data,vg0\n  lv_home,vg0\n"),
        );

        assert_eq!(query(&runner).resolve_volume_group("lv_data").unwrap(), "vg0");
        assert_eq!(
            runner.command_lines()[0],
            "lvs --noheadings --separator , -o lv_name,vg_name"
        );
    }

    #[test]
    fn test_resolve_volume_group_tolerates_quotes_and_headings() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  LV,VG\n  'lv_data','vg0'\n"));
        assert_eq!(query(&runner).resolve_volume_group("lv_data").unwrap(), "vg0");
    }

    #[test]
    fn test_resolve_volume_group_not_found() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  lv_root,vg_sys\n"));

        let err = query(&runner).resolve_volume_group("lv_data").unwrap_err();
        assert!(matches!(err, VolumeError::VolumeNotFound(ref n) if n == "lv_data"));
    }

    #[test]
    fn test_resolve_volume_group_does_not_prefix_match() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  lv_data_snap,vg0\n"));
        assert!(query(&runner).resolve_volume_group("lv_data").is_err());
    }

    #[test]
    fn test_resolve_volume_group_tool_failure() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::failed(5, "  No volume groups found\n"));

        let err = query(&runner).resolve_volume_group("lv_data").unwrap_err();
        match err {
            VolumeError::VolumeManager { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 5);
                assert_eq!(stderr, "No volume groups found");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    // ===========================================
    // capacity
    // ===========================================

    #[test]
    fn test_capacity_parses_bytes() {
        let runner = MockRunner::new();
        runner.on("vgs", CommandOutput::ok("  vg0,107374182400B,21474836480B\n"));

        let info = query(&runner).capacity("vg0").unwrap();
        assert_eq!(info.volume_group, "vg0");
        assert_eq!(info.total_bytes, 100 * GIB);
        assert_eq!(info.free_bytes, 20 * GIB);
        assert_eq!(runner.calls()[0].last_arg(), Some("vg0"));
    }

    #[test]
    fn test_capacity_whitespace_separated_with_units() {
        let runner = MockRunner::new();
        runner.on("vgs", CommandOutput::ok("  vg0   <100.00g   20.00g\n"));

        let info = query(&runner).capacity("vg0").unwrap();
        assert_eq!(info.total_bytes, 100 * GIB);
        assert_eq!(info.free_bytes, 20 * GIB);
    }

    #[test]
    fn test_capacity_tool_failure_carries_stderr() {
        let runner = MockRunner::new();
        runner.on("vgs", CommandOutput::failed(5, "Volume group \"vg9\" not found"));

        let err = query(&runner).capacity("vg9").unwrap_err();
        assert!(err.to_string().contains("not found"));
    }

    #[test]
    fn test_capacity_unparseable_size() {
        let runner = MockRunner::new();
        runner.on("vgs", CommandOutput::ok("  vg0,lots,some\n"));
        assert!(matches!(
            query(&runner).capacity("vg0"),
            Err(VolumeError::Parse { .. })
        ));
    }

    #[test]
    fn test_capacity_missing_row() {
        let runner = MockRunner::new();
        runner.on("vgs", CommandOutput::ok("\n"));
        assert!(matches!(
            query(&runner).capacity("vg0"),
            Err(VolumeError::Parse { .. })
        ));
    }

    // ===========================================
    // members
    // ===========================================

    #[test]
    fn test_members_parses_origin_and_snapshot() {
        let runner = MockRunner::new();
        runner.on(
            "lvs",
            CommandOutput::ok(
                "  lv_data,vg0,/dev/vg0/lv_data,10737418240B,\n  lv_data_snap,vg0,/dev/vg0/lv_data_snap,1073741824B,3.25\n",
            ),
        );

        let members = query(&runner).members("vg0").unwrap();
        assert_eq!(members.len(), 2);
        assert!(!members[0].is_snapshot());
        assert_eq!(members[1].name, "lv_data_snap");
        assert_eq!(members[1].device_path, PathBuf::from("/dev/vg0/lv_data_snap"));
        assert_eq!(members[1].size_bytes, GIB);
        assert_eq!(members[1].usage_percent, Some(3.25));
    }

    #[test]
    fn test_members_inactive_volume_gets_default_path() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  lv_old,vg0,,1024B,\n"));

        let members = query(&runner).members("vg0").unwrap();
        assert_eq!(members[0].device_path, PathBuf::from("/dev/vg0/lv_old"));
    }

    #[test]
    fn test_members_short_row_is_parse_error() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  lv_data,vg0\n"));
        assert!(matches!(
            query(&runner).members("vg0"),
            Err(VolumeError::Parse { .. })
        ));
    }

    #[test]
    fn test_find_member() {
        let runner = MockRunner::new();
        runner.on("lvs", CommandOutput::ok("  a,vg0,/dev/vg0/a,1B,\n  b,vg0,/dev/vg0/b,2B,1.00\n"));

        let q = query(&runner);
        assert_eq!(q.find_member("vg0", "b").unwrap().unwrap().size_bytes, 2);
        assert!(q.find_member("vg0", "c").unwrap().is_none());
    }
}
