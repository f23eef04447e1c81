//! The primary entry point and dispatcher for the command-line interface.
//!
//! This module parses the arguments, merges them with the configuration
//! file, sets up logging and dispatches to the subcommand's mode.

use clap::{CommandFactory, FromArgMatches};
use tracing::{debug, error, warn};

mod modes;
use modes::{run_compactify, run_enumerate, run_generate, run_package, run_verify};

mod arg_handling;
use arg_handling::{Args, Command, merge_config_and_args, validate_args};

mod cli_types;

mod error_handling;
use error_handling::{CliError, initiate_logging};

mod storage_io;
use crate::{
    cli_types::BuildPatchConfig,
    storage_io::{cleanup_old_logs, load_config},
};

/// Executes the mode selected by the subcommand.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` if the selected operation completes successfully.
/// - `Err(CliError)` if the operation fails.
fn run(args: &Args) -> Result<(), CliError> {
    match &args.command {
        Command::Generate(generate) => {
            debug!("Mode: Generate");
            run_generate(generate)
        }
        Command::Compactify(compactify) => {
            debug!("Mode: Compactify");
            run_compactify(compactify)
        }
        Command::Verify(verify) => {
            debug!("Mode: Verify");
            run_verify(verify)
        }
        Command::Enumerate(enumerate) => {
            debug!("Mode: Enumerate");
            run_enumerate(enumerate)
        }
        Command::Package(package) => {
            debug!("Mode: Package");
            run_package(package)
        }
    }
}

/// The main entry point for the command-line application.
///
/// Exits with status 1 when the configuration cannot be loaded, the
/// arguments are invalid or the operation fails.
fn main() -> Result<(), CliError> {
    let matches = Args::command().get_matches();
    let args = Args::from_arg_matches(&matches)?;

    //Load config from disk if the ignore_config flag isn't provided.
    let file_cfg = if args.ignore_config {
        BuildPatchConfig::default()
    } else {
        match load_config() {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load application configuration. Error: {e}");
                std::process::exit(1);
            }
        }
    };

    /*Determine which options supersede others between the user provided
    flags and the on disk config.*/
    let final_args = merge_config_and_args(&file_cfg, args, &matches);

    let guard = initiate_logging(final_args.verbose, final_args.quiet, &file_cfg.log_level)?;
    debug!(
        "Config {}.",
        if final_args.ignore_config { "ignored" } else { "loaded" }
    );

    //Cleanup old log files according to retention policy.
    if let Err(e) = cleanup_old_logs(file_cfg.log_retention_days) {
        warn!("Failed to clean up old log files. Error: {}", e);
    }

    if let Err(e) = validate_args(&final_args) {
        error!(error = %e, "Invalid command-line arguments. Please verify input.");
        drop(guard);
        std::process::exit(1);
    }

    match run(&final_args) {
        Ok(()) => {
            debug!("Application completed task successfully.");
            Ok(())
        }
        Err(e) => {
            error!("Application encountered an error and has exited. Error: {}", e);
            drop(guard);
            std::process::exit(1);
        }
    }
}
