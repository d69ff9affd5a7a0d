//! Logging abstraction for testable output.
//!
//! Provides a trait-based logging system that enables deterministic testing
//! of log output without depending on global state or external log crates.
//! A run logs to stderr and appends the same lines, timestamped, to
//! `<log_dir>/lvsnap.log`.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::{Arc, Mutex, RwLock};

use chrono::{TimeZone, Utc};
use lvsnap_clock::Clock;
use lvsnap_fs::FsError;

/// Severity of a log line. Ordered from most to least severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
}

impl Level {
    /// Threshold for a `-v` count: info by default, debug with any `-v`.
    pub fn from_verbosity(count: u8) -> Self {
        match count {
            0 => Level::Info,
            _ => Level::Debug,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
        }
    }
}

/// Trait for logging output.
pub trait Logger: Send + Sync {
    /// Log a message at the given level.
    fn log(&self, level: Level, message: &str);

    fn error(&self, message: &str) {
        self.log(Level::Error, message);
    }

    fn warn(&self, message: &str) {
        self.log(Level::Warn, message);
    }

    fn info(&self, message: &str) {
        self.log(Level::Info, message);
    }

    fn debug(&self, message: &str) {
        self.log(Level::Debug, message);
    }
}

impl<L: Logger + ?Sized> Logger for &L {
    fn log(&self, level: Level, message: &str) {
        (**self).log(level, message)
    }
}

/// Logger that writes `LEVEL: message` to stderr.
#[derive(Debug)]
pub struct StderrLogger {
    level: Level,
}

impl StderrLogger {
    pub fn new(level: Level) -> Self {
        Self { level }
    }
}

impl Logger for StderrLogger {
    fn log(&self, level: Level, message: &str) {
        if level <= self.level {
            let _ = writeln!(std::io::stderr(), "{}: {}", level.label(), message);
        }
    }
}

/// Appends `<timestamp> LEVEL: message` lines to a log file.
#[derive(Debug)]
pub struct FileLogger<C: Clock> {
    level: Level,
    clock: C,
    file: Mutex<File>,
}

impl<C: Clock> FileLogger<C> {
    /// Open `path` for appending, creating it and its directory if needed.
    pub fn open(path: &Path, level: Level, clock: C) -> Result<Self, FsError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| FsError::io("create directory", parent, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| FsError::io("open log", path, e))?;
        Ok(Self {
            level,
            clock,
            file: Mutex::new(file),
        })
    }
}

/// `YYYY-mm-dd HH:MM:SS` in UTC.
fn format_log_time(ts_unix: u64) -> String {
    Utc.timestamp_opt(ts_unix as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| ts_unix.to_string())
}

impl<C: Clock> Logger for FileLogger<C> {
    fn log(&self, level: Level, message: &str) {
        if level > self.level {
            return;
        }
        let line = format!(
            "{} {}: {}\n",
            format_log_time(self.clock.now_unix_sec()),
            level.label(),
            message
        );
        if let Ok(mut file) = self.file.lock() {
            let _ = file.write_all(line.as_bytes());
        }
    }
}

/// Sends every message to two loggers.
#[derive(Debug)]
pub struct TeeLogger<A: Logger, B: Logger> {
    first: A,
    second: B,
}

impl<A: Logger, B: Logger> TeeLogger<A, B> {
    pub fn new(first: A, second: B) -> Self {
        Self { first, second }
    }
}

impl<A: Logger, B: Logger> Logger for TeeLogger<A, B> {
    fn log(&self, level: Level, message: &str) {
        self.first.log(level, message);
        self.second.log(level, message);
    }
}

/// Mock logger for testing that captures all messages.
#[derive(Debug, Clone, Default)]
pub struct MockLogger {
    messages: Arc<RwLock<Vec<LogEntry>>>,
}

/// A captured log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub level: Level,
    pub message: String,
}

impl MockLogger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<LogEntry> {
        self.messages.read().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<String> {
        self.entries().iter().map(|e| e.message.clone()).collect()
    }

    pub fn messages_at_level(&self, level: Level) -> Vec<String> {
        self.entries()
            .iter()
            .filter(|e| e.level == level)
            .map(|e| e.message.clone())
            .collect()
    }

    /// Check if any message contains the given substring.
    pub fn contains(&self, substring: &str) -> bool {
        self.messages().iter().any(|m| m.contains(substring))
    }

    pub fn count(&self) -> usize {
        self.messages.read().unwrap().len()
    }
}

impl Logger for MockLogger {
    fn log(&self, level: Level, message: &str) {
        // Captured regardless of level so tests can see debug detail.
        self.messages.write().unwrap().push(LogEntry {
            level,
            message: message.to_string(),
        });
    }
}

/// A no-op logger that discards all messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullLogger;

impl Logger for NullLogger {
    fn log(&self, _level: Level, _message: &str) {}
}
