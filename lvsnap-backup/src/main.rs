//! lvsnap CLI binary.
//!
//! Entry point for the `lvsnap` command-line tool.

use std::process::ExitCode;
use std::time::Duration;

use clap::Parser;
use lvsnap_backup::exit::{codes, exit_code};
use lvsnap_backup::{
    BackupConfig, Cli, Collaborators, CommandError, FileLogger, LifecycleController, Logger,
    RunLock, StderrLogger, TeeLogger,
};
use lvsnap_clock::{RealSleeper, SystemClock};
use lvsnap_fs::{RealFilesystem, TarArchiveWriter};
use lvsnap_volume::SystemRunner;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) if e.use_stderr() => {
            let _ = e.print();
            return ExitCode::from(codes::INVALID_ARGS as u8);
        }
        Err(e) => e.exit(),
    };

    match run(cli) {
        Ok(()) => ExitCode::from(codes::SUCCESS as u8),
        Err(e) => {
            // Run failures were already written to the log.
            if !matches!(e, CommandError::Run(_)) {
                eprintln!("error: {}", e);
            }
            ExitCode::from(exit_code(&e) as u8)
        }
    }
}

fn run(cli: Cli) -> Result<(), CommandError> {
    let hostname = hostname::get()
        .map_err(CommandError::Hostname)?
        .to_string_lossy()
        .into_owned();
    let config = BackupConfig::from_cli(&cli, &hostname)?;

    let logger: Box<dyn Logger> =
        match FileLogger::open(&config.log_path(), config.log_level, SystemClock) {
            Ok(file) => Box::new(TeeLogger::new(StderrLogger::new(config.log_level), file)),
            Err(e) => {
                let stderr = StderrLogger::new(config.log_level);
                stderr.warn(&format!("logging to stderr only: {}", e));
                Box::new(stderr)
            }
        };

    let _lock = RunLock::acquire(&config.lock_path())?;

    let deps = Collaborators {
        runner: SystemRunner::new(Duration::from_secs(config.command_timeout_secs)),
        sleeper: RealSleeper::new(),
        fs: RealFilesystem,
        archiver: TarArchiveWriter::new(SystemClock),
        clock: SystemClock,
        logger: &*logger,
    };
    let mut controller = LifecycleController::new(&config, deps);
    let report = controller.run()?;

    if let Some(sweep) = &report.sweep {
        logger.info(&format!(
            "retention: {} archive(s) kept, {} removed",
            sweep.kept.len(),
            sweep.removed.len()
        ));
    }
    if !report.warnings.is_empty() {
        logger.warn(&format!("finished with {} warning(s)", report.warnings.len()));
    }
    Ok(())
}
