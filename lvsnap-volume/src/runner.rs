//! External command invocation.
//!
//! Every LVM, mount and `du` call goes through `CommandRunner`. A run is a
//! blocking call with a bounded wait that captures exit code, stdout and
//! stderr. A non-zero exit is returned as data; only failing to start the
//! tool or exceeding the timeout is a `RunnerError`.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io::{self, Read};
use std::os::unix::process::ExitStatusExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Default bound on a single external command.
pub const DEFAULT_TIMEOUT_SECS: u64 = 3600;

/// How often a running child is polled for completion.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// A program and its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Space-joined program and arguments, for logs and error messages.
    pub fn command_line(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(arg);
        }
        line
    }

    /// Value following `flag`, e.g. `value_of("-o")`.
    pub fn value_of(&self, flag: &str) -> Option<&str> {
        let pos = self.args.iter().position(|a| a == flag)?;
        self.args.get(pos + 1).map(String::as_str)
    }

    pub fn has_flag(&self, flag: &str) -> bool {
        self.args.iter().any(|a| a == flag)
    }

    /// Last argument, typically the object the command operates on.
    pub fn last_arg(&self) -> Option<&str> {
        self.args.last().map(String::as_str)
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.command_line())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// Exit 0 with the given stdout.
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stderr with surrounding whitespace removed.
    pub fn stderr_text(&self) -> String {
        self.stderr.trim().to_string()
    }
}

/// Errors starting or waiting for a command.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("{program} did not finish within {timeout_secs}s and was killed")]
    Timeout { program: String, timeout_secs: u64 },

    #[error("failed waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: io::Error,
    },
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError>;
}

impl<R: CommandRunner + ?Sized> CommandRunner for &R {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        (**self).run(spec)
    }
}

/// Runs commands on the host with a per-command timeout.
///
/// Commands run with `LC_ALL=C` so numeric output uses `.` as the decimal
/// separator regardless of the operator's locale.
#[derive(Debug, Clone, Copy)]
pub struct SystemRunner {
    timeout: Duration,
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new(Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }
}

impl SystemRunner {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        buf
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    // Killed by a signal: report it the way shells do.
    status
        .code()
        .or_else(|| status.signal().map(|s| 128 + s))
        .unwrap_or(-1)
}

/// Kill `child` and reap it so no zombie is left behind.
fn abandon(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

impl CommandRunner for SystemRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: spec.program.clone(),
                source,
            })?;

        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());
        let started = Instant::now();

        let status = loop {
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) if started.elapsed() >= self.timeout => {
                    abandon(&mut child);
                    // Reader threads are detached: a grandchild may still hold the pipes.
                    return Err(RunnerError::Timeout {
                        program: spec.program.clone(),
                        timeout_secs: self.timeout.as_secs(),
                    });
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(source) => {
                    abandon(&mut child);
                    return Err(RunnerError::Wait {
                        program: spec.program.clone(),
                        source,
                    });
                }
            }
        };

        Ok(CommandOutput {
            exit_code: exit_code(status),
            stdout: String::from_utf8_lossy(&stdout.join().unwrap_or_default()).into_owned(),
            stderr: String::from_utf8_lossy(&stderr.join().unwrap_or_default()).into_owned(),
        })
    }
}

#[derive(Debug, Clone)]
enum Scripted {
    Output(CommandOutput),
    Timeout,
}

/// Scripted runner for tests.
///
/// Responses are queued per program name and consumed in order; the last
/// queued response for a program repeats. Unscripted programs exit 127.
/// Clones share the script and the call log.
#[derive(Debug, Clone, Default)]
pub struct MockRunner {
    script: Arc<Mutex<HashMap<String, VecDeque<Scripted>>>>,
    calls: Arc<Mutex<Vec<CommandSpec>>>,
}

impl MockRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response for `program`.
    pub fn on(&self, program: &str, output: CommandOutput) -> &Self {
        self.push(program, Scripted::Output(output));
        self
    }

    /// Queue a timeout for `program`.
    pub fn on_timeout(&self, program: &str) -> &Self {
        self.push(program, Scripted::Timeout);
        self
    }

    fn push(&self, program: &str, response: Scripted) {
        self.script
            .lock()
            .unwrap()
            .entry(program.to_string())
            .or_default()
            .push_back(response);
    }

    pub fn calls(&self) -> Vec<CommandSpec> {
        self.calls.lock().unwrap().clone()
    }

    pub fn command_lines(&self) -> Vec<String> {
        self.calls().iter().map(CommandSpec::command_line).collect()
    }

    pub fn call_count(&self, program: &str) -> usize {
        self.calls().iter().filter(|c| c.program == program).count()
    }
}

impl CommandRunner for MockRunner {
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, RunnerError> {
        self.calls.lock().unwrap().push(spec.clone());

        let response = {
            let mut script = self.script.lock().unwrap();
            match script.get_mut(&spec.program) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match response {
            Some(Scripted::Output(output)) => Ok(output),
            Some(Scripted::Timeout) => Err(RunnerError::Timeout {
                program: spec.program.clone(),
                timeout_secs: 0,
            }),
            None => Ok(CommandOutput::failed(
                127,
                format!("{}: command not scripted", spec.program),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ===========================================
    // CommandSpec
    // ===========================================

    #[test]
    fn test_command_line() {
        let spec = CommandSpec::new("lvs").args(["--noheadings", "-o", "lv_name"]).arg("vg0");
        assert_eq!(spec.command_line(), "lvs --noheadings -o lv_name vg0");
        assert_eq!(spec.to_string(), spec.command_line());
    }

    #[test]
    fn test_value_of_and_flags() {
        let spec = CommandSpec::new("lvs").args(["-o", "lv_name,vg_name", "vg0"]);
        assert_eq!(spec.value_of("-o"), Some("lv_name,vg_name"));
        assert_eq!(spec.value_of("--units"), None);
        assert!(spec.has_flag("-o"));
        assert_eq!(spec.last_arg(), Some("vg0"));
    }

    // ===========================================
    // SystemRunner
    // ===========================================

    #[test]
    fn test_system_runner_captures_streams() {
        let runner = SystemRunner::new(Duration::from_secs(10));
        let spec = CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]);

        let output = runner.run(&spec).expect("run");

        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr_text(), "err");
        assert!(!output.success());
    }

    #[test]
    fn test_system_runner_sets_c_locale() {
        let runner = SystemRunner::default();
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo $LC_ALL"]))
            .expect("run");
        assert_eq!(output.stdout.trim(), "C");
    }

    #[test]
    fn test_system_runner_timeout_kills_child() {
        let runner = SystemRunner::new(Duration::from_millis(200));
        let started = Instant::now();

        let err = runner
            .run(&CommandSpec::new("sleep").arg("30"))
            .unwrap_err();

        assert!(matches!(err, RunnerError::Timeout { .. }));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_abandon_reaps_child() {
        let mut child = Command::new("sleep").arg("30").spawn().expect("spawn");
        let proc_dir = std::path::PathBuf::from(format!("/proc/{}", child.id()));

        abandon(&mut child);

        // A zombie keeps its /proc entry until it is waited on.
        assert!(!proc_dir.exists());
        assert!(child.try_wait().expect("try_wait").is_some());
    }

    #[test]
    fn test_system_runner_missing_program() {
        let err = SystemRunner::default()
            .run(&CommandSpec::new("lvsnap-definitely-not-installed"))
            .unwrap_err();
        assert!(matches!(err, RunnerError::Spawn { .. }));
    }

    // ===========================================
    // MockRunner
    // ===========================================

    #[test]
    fn test_mock_runner_queue_then_repeat_last() {
        let runner = MockRunner::new();
        runner
            .on("vgs", CommandOutput::ok("first"))
            .on("vgs", CommandOutput::ok("second"));

        let spec = CommandSpec::new("vgs");
        assert_eq!(runner.run(&spec).unwrap().stdout, "first");
        assert_eq!(runner.run(&spec).unwrap().stdout, "second");
        assert_eq!(runner.run(&spec).unwrap().stdout, "second");
        assert_eq!(runner.call_count("vgs"), 3);
    }

    #[test]
    fn test_mock_runner_unscripted_program() {
        let runner = MockRunner::new();
        let output = runner.run(&CommandSpec::new("lvs")).unwrap();
        assert_eq!(output.exit_code, 127);
    }

    #[test]
    fn test_mock_runner_timeout() {
        let runner = MockRunner::new();
        runner.on_timeout("lvcreate");
        assert!(matches!(
            runner.run(&CommandSpec::new("lvcreate")),
            Err(RunnerError::Timeout { .. })
        ));
    }

    #[test]
    fn test_mock_runner_records_command_lines() {
        let runner = MockRunner::new();
        let _ = runner.run(&CommandSpec::new("umount").arg("/mnt"));
        assert_eq!(runner.command_lines(), vec!["umount /mnt".to_string()]);
    }
}
