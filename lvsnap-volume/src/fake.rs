//! Stateful stand-in for an LVM host.
//!
//! `FakeVolumeHost` answers `lvs`, `vgs`, `lvcreate`, `lvremove`, `mount`,
//! `umount`, `mountpoint` and `du` from in-memory state, so a whole backup
//! run can be driven without root or real volumes. Snapshots consume group
//! free space, mounted snapshots refuse removal, and individual programs can
//! be forced to fail or time out.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::runner::{CommandOutput, CommandRunner, CommandSpec, RunnerError};

#[derive(Debug, Clone)]
struct FakeGroup {
    total_bytes: u64,
    free_bytes: u64,
}

#[derive(Debug, Clone)]
struct FakeVolume {
    name: String,
    volume_group: String,
    size_bytes: u64,
    /// Set for snapshots only.
    usage_percent: Option<f64>,
}

impl FakeVolume {
    fn device_path(&self) -> PathBuf {
        PathBuf::from(format!("/dev/{}/{}", self.volume_group, self.name))
    }
}

#[derive(Debug, Clone)]
struct FakeMount {
    device: PathBuf,
    options: Option<String>,
}

#[derive(Debug, Default)]
struct HostState {
    groups: BTreeMap<String, FakeGroup>,
    volumes: Vec<FakeVolume>,
    mounts: BTreeMap<PathBuf, FakeMount>,
    usage: HashMap<PathBuf, u64>,
    failures: HashMap<String, CommandOutput>,
    timeouts: HashSet<String>,
    hide_after_create: u32,
    hidden: Option<(String, u32)>,
    calls: Vec<CommandSpec>,
}

/// In-memory LVM host implementing `CommandRunner`.
///
/// Clones share state.
#[derive(Debug, Clone, Default)]
pub struct FakeVolumeHost {
    state: Arc<Mutex<HostState>>,
}

impl FakeVolumeHost {
    pub fn new() -> Self {
        Self::default()
    }

    // --- setup ---

    pub fn add_group(&self, name: &str, total_bytes: u64, free_bytes: u64) -> &Self {
        self.state.lock().unwrap().groups.insert(
            name.to_string(),
            FakeGroup {
                total_bytes,
                free_bytes,
            },
        );
        self
    }

    /// Add an ordinary (origin) logical volume.
    pub fn add_volume(&self, volume_group: &str, name: &str, size_bytes: u64) -> &Self {
        self.insert_volume(volume_group, name, size_bytes, None)
    }

    /// Add a snapshot as if left over by an earlier run.
    pub fn add_snapshot(&self, volume_group: &str, name: &str, size_bytes: u64) -> &Self {
        self.insert_volume(volume_group, name, size_bytes, Some(0.0))
    }

    fn insert_volume(
        &self,
        volume_group: &str,
        name: &str,
        size_bytes: u64,
        usage_percent: Option<f64>,
    ) -> &Self {
        self.state.lock().unwrap().volumes.push(FakeVolume {
            name: name.to_string(),
            volume_group: volume_group.to_string(),
            size_bytes,
            usage_percent,
        });
        self
    }

    /// Bytes `du` reports for `path`.
    pub fn set_usage(&self, path: impl Into<PathBuf>, bytes: u64) -> &Self {
        self.state.lock().unwrap().usage.insert(path.into(), bytes);
        self
    }

    /// Pretend `device` is already mounted on `mount_point`.
    pub fn add_mount(&self, device: impl Into<PathBuf>, mount_point: impl Into<PathBuf>) -> &Self {
        self.state.lock().unwrap().mounts.insert(
            mount_point.into(),
            FakeMount {
                device: device.into(),
                options: None,
            },
        );
        self
    }

    /// Make every later call of `program` exit with `exit_code`.
    pub fn fail(&self, program: &str, exit_code: i32, stderr: &str) -> &Self {
        self.state
            .lock()
            .unwrap()
            .failures
            .insert(program.to_string(), CommandOutput::failed(exit_code, stderr));
        self
    }

    pub fn clear_failure(&self, program: &str) -> &Self {
        self.state.lock().unwrap().failures.remove(program);
        self
    }

    /// Make every later call of `program` time out.
    pub fn time_out(&self, program: &str) -> &Self {
        self.state.lock().unwrap().timeouts.insert(program.to_string());
        self
    }

    /// Leave a newly created snapshot out of the next `listings` member
    /// listings, like a device node that is slow to appear.
    pub fn hide_new_snapshots(&self, listings: u32) -> &Self {
        self.state.lock().unwrap().hide_after_create = listings;
        self
    }

    // --- inspection ---

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    pub fn call_count(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }

    pub fn has_volume(&self, volume_group: &str, name: &str) -> bool {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .any(|v| v.volume_group == volume_group && v.name == name)
    }

    /// Names of all snapshots currently present.
    pub fn snapshots(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .volumes
            .iter()
            .filter(|v| v.usage_percent.is_some())
            .map(|v| v.name.clone())
            .collect()
    }

    pub fn free_bytes(&self, volume_group: &str) -> Option<u64> {
        self.state
            .lock()
            .unwrap()
            .groups
            .get(volume_group)
            .map(|g| g.free_bytes)
    }

    pub fn is_mounted(&self, mount_point: &Path) -> bool {
        self.state.lock().unwrap().mounts.contains_key(mount_point)
    }

    /// Option string used by the mount currently on `mount_point`.
    pub fn mount_options(&self, mount_point: &Path) -> Option<String> {
        self.state
            .lock()
            .unwrap()
            .mounts
            .get(mount_point)
            .and_then(|m| m.options.clone())
    }
}

impl CommandRunner for FakeVolumeHost {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(spec.clone());

        if state.timeouts.contains(&spec.program) {
            return Err(RunnerError::Timeout {
                program: spec.program.clone(),
                timeout_secs: 0,
            });
        }
        if let Some(output) = state.failures.get(&spec.program) {
            return Ok(output.clone());
        }

        Ok(match spec.program.as_str() {
            "lvs" => state.lvs(spec),
            "vgs" => state.vgs(spec),
            "lvcreate" => state.lvcreate(spec),
            "lvremove" => state.lvremove(spec),
            "mount" => state.mount(spec),
            "umount" => state.umount(spec),
            "mountpoint" => state.mountpoint(spec),
            "du" => state.du(spec),
            other => CommandOutput::failed(127, format!("{}: command not found", other)),
        })
    }
}

impl HostState {
    fn lvs(&mut self, spec: &CommandSpec) -> CommandOutput {
        let fields = spec.value_of("-o").unwrap_or_default();
        if fields == "lv_name,vg_name" {
            let mut out = String::new();
            for v in &self.volumes {
                out.push_str(&format!("  {},{}\n", v.name, v.volume_group));
            }
            return CommandOutput::ok(out);
        }

        let Some(group) = spec.last_arg().map(str::to_string) else {
            return CommandOutput::failed(3, "missing volume group");
        };
        if !self.groups.contains_key(&group) {
            return CommandOutput::failed(5, format!("  Volume group \"{}\" not found", group));
        }

        let hidden = match self.hidden.as_mut() {
            Some((name, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(name.clone())
            }
            _ => None,
        };

        let mut out = String::new();
        for v in self.volumes.iter().filter(|v| v.volume_group == group) {
            if hidden.as_deref() == Some(v.name.as_str()) {
                continue;
            }
            let percent = v
                .usage_percent
                .map(|p| format!("{:.2}", p))
                .unwrap_or_default();
            out.push_str(&format!(
                "  {},{},{},{}B,{}\n",
                v.name,
                v.volume_group,
                v.device_path().display(),
                v.size_bytes,
                percent
            ));
        }
        CommandOutput::ok(out)
    }

    fn vgs(&self, spec: &CommandSpec) -> CommandOutput {
        let group = spec.last_arg().unwrap_or_default();
        match self.groups.get(group) {
            Some(g) => CommandOutput::ok(format!(
                "  {},{}B,{}B\n",
                group, g.total_bytes, g.free_bytes
            )),
            None => CommandOutput::failed(5, format!("  Volume group \"{}\" not found", group)),
        }
    }

    fn lvcreate(&mut self, spec: &CommandSpec) -> CommandOutput {
        let size = spec
            .value_of("--size")
            .and_then(|s| s.strip_suffix('b'))
            .and_then(|s| s.parse::<u64>().ok());
        let name = spec.value_of("--name");
        let origin = spec.last_arg().and_then(|a| a.split_once('/'));

        let (Some(size), Some(name), Some((group, source)), true) =
            (size, name, origin, spec.has_flag("--snapshot"))
        else {
            return CommandOutput::failed(3, "  Invalid argument list");
        };

        if !self
            .volumes
            .iter()
            .any(|v| v.volume_group == group && v.name == source)
        {
            return CommandOutput::failed(
                5,
                format!("  Failed to find logical volume \"{}/{}\"", group, source),
            );
        }
        if self
            .volumes
            .iter()
            .any(|v| v.volume_group == group && v.name == name)
        {
            return CommandOutput::failed(
                5,
                format!("  Logical Volume \"{}\" already exists in volume group \"{}\"", name, group),
            );
        }
        let Some(g) = self.groups.get_mut(group) else {
            return CommandOutput::failed(5, format!("  Volume group \"{}\" not found", group));
        };
        if g.free_bytes < size {
            return CommandOutput::failed(
                5,
                format!("  Volume group \"{}\" has insufficient free space", group),
            );
        }
        g.free_bytes -= size;

        self.volumes.push(FakeVolume {
            name: name.to_string(),
            volume_group: group.to_string(),
            size_bytes: size,
            usage_percent: Some(0.0),
        });
        if self.hide_after_create > 0 {
            self.hidden = Some((name.to_string(), self.hide_after_create));
        }
        CommandOutput::ok(format!("  Logical volume \"{}\" created.\n", name))
    }

    fn lvremove(&mut self, spec: &CommandSpec) -> CommandOutput {
        let Some(target) = spec.last_arg() else {
            return CommandOutput::failed(3, "  Please enter one or more logical volume paths");
        };
        // Accepts `/dev/vg/lv` as well as `vg/lv`.
        let mut parts = target.rsplit('/');
        let (Some(name), Some(group)) = (parts.next(), parts.next()) else {
            return CommandOutput::failed(5, format!("  Failed to find logical volume \"{}\"", target));
        };

        let Some(index) = self
            .volumes
            .iter()
            .position(|v| v.volume_group == group && v.name == name)
        else {
            return CommandOutput::failed(
                5,
                format!("  Failed to find logical volume \"{}/{}\"", group, name),
            );
        };

        let device = self.volumes[index].device_path();
        if self.mounts.values().any(|m| m.device == device) {
            return CommandOutput::failed(
                5,
                format!("  Logical volume {}/{} contains a filesystem in use.", group, name),
            );
        }

        let removed = self.volumes.remove(index);
        if let Some(g) = self.groups.get_mut(group) {
            g.free_bytes += removed.size_bytes;
        }
        CommandOutput::ok(format!("  Logical volume \"{}\" successfully removed\n", name))
    }

    fn mount(&mut self, spec: &CommandSpec) -> CommandOutput {
        let options = spec.value_of("-o").map(str::to_string);
        let n = spec.args.len();
        if n < 2 {
            return CommandOutput::failed(1, "mount: bad usage");
        }
        let device = PathBuf::from(&spec.args[n - 2]);
        let mount_point = PathBuf::from(&spec.args[n - 1]);

        if !self.volumes.iter().any(|v| v.device_path() == device) {
            return CommandOutput::failed(
                32,
                format!("mount: {}: special device {} does not exist.", mount_point.display(), device.display()),
            );
        }
        if self.mounts.contains_key(&mount_point) {
            return CommandOutput::failed(
                32,
                format!("mount: {}: {} already mounted or mount point busy.", mount_point.display(), device.display()),
            );
        }
        self.mounts.insert(mount_point, FakeMount { device, options });
        CommandOutput::ok("")
    }

    fn umount(&mut self, spec: &CommandSpec) -> CommandOutput {
        let Some(target) = spec.last_arg() else {
            return CommandOutput::failed(1, "umount: bad usage");
        };
        match self.mounts.remove(Path::new(target)) {
            Some(_) => CommandOutput::ok(""),
            None => CommandOutput::failed(32, format!("umount: {}: not mounted.", target)),
        }
    }

    fn mountpoint(&self, spec: &CommandSpec) -> CommandOutput {
        let target = spec.last_arg().unwrap_or_default();
        if self.mounts.contains_key(Path::new(target)) {
            CommandOutput::ok("")
        } else {
            CommandOutput::failed(32, "")
        }
    }

    fn du(&self, spec: &CommandSpec) -> CommandOutput {
        let target = spec.last_arg().unwrap_or_default();
        match self.usage.get(Path::new(target)) {
            Some(bytes) => CommandOutput::ok(format!("{}\t{}\n", bytes, target)),
            None => CommandOutput::failed(
                1,
                format!("du: cannot access '{}': No such file or directory", target),
            ),
        }
    }
}
