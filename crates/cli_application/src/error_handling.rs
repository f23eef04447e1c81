//! Declares the error handling types for the command-line application.
//!
//! This module defines the `CliError` enum, which wraps every failure the
//! tool can report, and sets up logging for the process.

use std::{io, path::PathBuf};

use buildpatch::BuildPatchError;
use directories::ProjectDirs;
use thiserror::Error;
use tracing::{debug, level_filters::LevelFilter, warn};
use tracing_appender::{non_blocking::WorkerGuard, rolling};
use tracing_subscriber::{fmt, prelude::*, registry};

use crate::cli_types::APPIDENTIFIER;

/// Represents all possible errors that can occur in the application.
#[derive(Error, Debug)]
pub enum CliError {
    #[error("I/O Error {0}")]
    IoError(#[from] io::Error),

    #[error("Provided path does not exist. {0}")]
    InvalidPath(String),

    #[error("Required flag missing. {0}")]
    MissingFlag(String),

    #[error("Conflicting arguments provided: {0}")]
    ConflictingArguments(String),

    #[error("Invalid argument value: {0}")]
    InvalidValue(String),

    #[error("{0}")]
    OperationFailed(String),

    #[error("No valid project directory could be determined.")]
    NoProjectDir,

    #[error("Library error: {0}")]
    BuildPatch(#[from] BuildPatchError),

    #[error("Confy config error {0}")]
    ConfigError(#[from] confy::ConfyError),

    #[error("Argument parsing error: {0}")]
    ArgumentParsing(#[from] clap::Error),

    #[error("Logging Subscriber Error {0}")]
    LoggingSubscriberError(#[from] tracing_subscriber::util::TryInitError),

    #[error("Serde json error {0}")]
    SerdeJsonError(#[from] serde_json::Error),
}

/// Returns the directory log files are written to.
pub fn log_directory() -> Result<PathBuf, CliError> {
    let proj_dirs = ProjectDirs::from(
        APPIDENTIFIER.qualifier,
        APPIDENTIFIER.organization,
        APPIDENTIFIER.application,
    )
    .ok_or(CliError::NoProjectDir)?;

    Ok(proj_dirs.data_local_dir().join("logs"))
}

/// Maps the console flags to a level filter. Quiet wins over verbose.
fn console_level(verbose: bool, quiet: bool) -> LevelFilter {
    match (quiet, verbose) {
        (true, _) => LevelFilter::OFF,
        (false, true) => LevelFilter::DEBUG,
        (false, false) => LevelFilter::INFO,
    }
}

/// Sets up console and file logging for the process.
///
/// The console layer prints plain messages at a level chosen by the
/// `verbose` and `quiet` flags. Unless `file_log_level` is "off", a
/// second layer writes JSON records to a daily rolling `debug.log` in the
/// local data directory.
///
/// # Arguments
///
/// * `verbose`: Print debug messages to the console.
/// * `quiet`: Print nothing to the console.
/// * `file_log_level`: One of "error", "warning", "info", "debug" or
///   "off". Unknown values fall back to "error" with a warning.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(Some(WorkerGuard))` when file logging is enabled. The guard must
///   be held until exit so buffered records are flushed.
/// - `Ok(None)` when file logging is disabled.
/// - `Err(CliError)` if a global subscriber was already installed.
pub fn initiate_logging(
    verbose: bool,
    quiet: bool,
    file_log_level: &str,
) -> Result<Option<WorkerGuard>, CliError> {
    let console_layer = fmt::layer()
        .with_writer(std::io::stdout)
        .without_time()
        .with_level(verbose)
        .with_target(false)
        .with_filter(console_level(verbose, quiet));

    if file_log_level == "off" {
        registry().with(console_layer).try_init()?;
        debug!("Log file disabled.");
        return Ok(None);
    }

    let mut warning_flag = false;
    let log_file_level = match file_log_level {
        "error" => LevelFilter::ERROR,
        "warning" => LevelFilter::WARN,
        "info" => LevelFilter::INFO,
        "debug" => LevelFilter::DEBUG,
        _ => {
            warning_flag = true;
            LevelFilter::ERROR
        }
    };

    let file_appender = rolling::daily(log_directory()?, "debug.log");
    let (non_blocking_writer, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .json()
        .with_writer(non_blocking_writer)
        .with_filter(log_file_level);

    registry().with(file_layer.and_then(console_layer)).try_init()?;

    if warning_flag {
        warn!("Invalid log level provided in config. Defaulting level to ERROR.");
    } else {
        debug!("Log file enabled.");
    }

    Ok(Some(guard))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_overrides_verbose() {
        assert_eq!(console_level(true, true), LevelFilter::OFF);
        assert_eq!(console_level(true, false), LevelFilter::DEBUG);
        assert_eq!(console_level(false, false), LevelFilter::INFO);
    }
}
