//! lvsnap backup controller.
//!
//! This crate provides the `lvsnap` command: argument parsing and
//! validation, the snapshot backup lifecycle, logging, the run lock and the
//! mapping of failures to exit codes.

pub mod cli;
pub mod config;
pub mod exit;
pub mod lifecycle;
pub mod lock;
pub mod logger;
pub mod permissions;

use std::io;

use thiserror::Error;

pub use cli::{parse_from, Cli, CliError};
pub use config::BackupConfig;
pub use lifecycle::{
    BackupError, BackupReport, CleanupFailure, Collaborators, LifecycleController, RunFailure,
    Stage,
};
pub use lock::{LockError, RunLock};
pub use logger::{FileLogger, Level, Logger, MockLogger, NullLogger, StderrLogger, TeeLogger};

/// Errors from the `lvsnap` command as a whole.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("invalid argument: {0}")]
    InvalidArgument(#[from] CliError),

    #[error("cannot determine hostname: {0}")]
    Hostname(#[source] io::Error),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Run(#[from] RunFailure),
}
