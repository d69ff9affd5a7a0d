//! Disk usage of a mounted tree.

use std::path::Path;

use crate::error::{VolumeError, VolumeResult};
use crate::runner::{CommandRunner, CommandSpec};

/// Measures used bytes under a path with `du`.
#[derive(Debug, Clone)]
pub struct DiskUsage<R: CommandRunner> {
    runner: R,
}

impl<R: CommandRunner> DiskUsage<R> {
    pub fn new(runner: R) -> Self {
        Self { runner }
    }

    /// Total bytes used under `path`.
    ///
    /// `du` exits non-zero when it cannot read part of the tree but still
    /// prints a total; such a total is accepted.
    pub fn used_bytes(&self, path: &Path) -> VolumeResult<u64> {
        let spec = CommandSpec::new("du")
            .args(["-s", "-B1"])
            .arg(path.display().to_string());
        let output = self.runner.run(&spec)?;

        let total = output
            .stdout
            .lines()
            .next()
            .and_then(|line| line.split_whitespace().next())
            .and_then(|token| token.parse::<u64>().ok());

        match total {
            Some(bytes) => Ok(bytes),
            None if !output.success() => Err(VolumeError::manager(&spec, &output)),
            None => Err(VolumeError::parse(
                &spec,
                format!("no total in {:?}", output.stdout.trim()),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::{CommandOutput, MockRunner};

    #[test]
    fn test_used_bytes() {
        let runner = MockRunner::new();
        runner.on("du", CommandOutput::ok("1048576000\t/data\n"));

        let usage = DiskUsage::new(&runner);
        assert_eq!(usage.used_bytes(Path::new("/data")).unwrap(), 1_048_576_000);
        assert_eq!(runner.command_lines(), vec!["du -s -B1 /data"]);
    }

    #[test]
    fn test_partial_read_still_reports_total() {
        let runner = MockRunner::new();
        runner.on(
            "du",
            CommandOutput {
                exit_code: 1,
                stdout: "4096\t/data\n".to_string(),
                stderr: "du: cannot read directory '/data/lost+found': Permission denied\n"
                    .to_string(),
            },
        );

        let usage = DiskUsage::new(&runner);
        assert_eq!(usage.used_bytes(Path::new("/data")).unwrap(), 4096);
    }

    #[test]
    fn test_failure_without_total() {
        let runner = MockRunner::new();
        runner.on("du", CommandOutput::failed(1, "du: cannot access '/nope'"));

        let err = DiskUsage::new(&runner)
            .used_bytes(Path::new("/nope"))
            .unwrap_err();
        assert!(matches!(err, VolumeError::VolumeManager { exit_code: 1, .. }));
    }

    #[test]
    fn test_garbage_output_is_parse_error() {
        let runner = MockRunner::new();
        runner.on("du", CommandOutput::ok("what\n"));

        let err = DiskUsage::new(&runner)
            .used_bytes(Path::new("/data"))
            .unwrap_err();
        assert!(matches!(err, VolumeError::Parse { .. }));
    }

    #[test]
    fn test_timeout_propagates() {
        let runner = MockRunner::new();
        runner.on_timeout("du");

        let err = DiskUsage::new(&runner)
            .used_bytes(Path::new("/data"))
            .unwrap_err();
        assert!(err.is_timeout());
    }
}
