//! Manages command-line argument parsing and validation.
//!
//! This module defines the command-line interface using `clap`. Each
//! operation of the tool is a subcommand with its own options, while the
//! console and config flags are global.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use bytesize::ByteSize;
use clap::{ArgMatches, Args as ClapArgs, Parser, Subcommand, parser::ValueSource};

use crate::{cli_types::BuildPatchConfig, error_handling::CliError};

const CUSTOM_HELP_TEMPLATE: &str = "\
{before-help}{name} {version}
{author-with-newline}{about-with-newline}
{all-args}{after-help}
";

/// Defines the command-line arguments for the application.
#[derive(Clone, Parser, Debug)]
#[command(version, about, long_about = None,
    help_template = CUSTOM_HELP_TEMPLATE)]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    ///Activates verbose output for detailed diagnostic information.
    #[arg(short, long, global = true, help_heading = "Behavior and Output Control")]
    pub verbose: bool,

    ///Activates quiet mode, suppressing all non-essential output.
    #[arg(short, long, global = true, help_heading = "Behavior and Output Control")]
    pub quiet: bool,

    ///Ignores the on disk configuration file and uses built in defaults.
    #[arg(long, global = true, help_heading = "Behavior and Output Control")]
    pub ignore_config: bool,
}

/// The operations the tool can perform.
#[derive(Clone, Subcommand, Debug)]
pub enum Command {
    ///Chunks a build directory and saves a manifest describing it.
    Generate(GenerateArgs),
    ///Deletes data in a cloud directory that no manifest references.
    Compactify(CompactifyArgs),
    ///Checks chunk files, chunk databases and manifests for corruption.
    Verify(VerifyArgs),
    ///Lists the data files a manifest or chunk database consists of.
    Enumerate(EnumerateArgs),
    ///Packs the chunks of a manifest into chunk database files.
    Package(PackageArgs),
}

#[derive(Clone, ClapArgs, Debug)]
pub struct GenerateArgs {
    ///Root directory of the build to chunk.
    #[arg(long, help_heading = "Primary Options")]
    pub build_root: PathBuf,

    ///Directory chunks are reused from and written to.
    #[arg(long, help_heading = "Primary Options")]
    pub cloud_dir: PathBuf,

    ///File name of the manifest saved in the cloud directory.
    #[arg(long, help_heading = "Primary Options")]
    pub manifest: String,

    ///Numeric application id stored in the manifest.
    #[arg(long, help_heading = "Build Metadata", default_value_t = 0)]
    pub app_id: u32,

    ///Application name stored in the manifest.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub app_name: String,

    ///Build version stored in the manifest.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub build_version: String,

    ///Build relative path of the executable to launch.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub launch_exe: String,

    ///Arguments passed to the launch executable.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub launch_command: String,

    ///Prerequisite id. Can be specified more than once.
    #[arg(long = "prereq-id", help_heading = "Build Metadata")]
    pub prereq_ids: Vec<String>,

    ///Display name of the prerequisite installer.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub prereq_name: String,

    ///Build relative path of the prerequisite installer.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub prereq_path: String,

    ///Arguments passed to the prerequisite installer.
    #[arg(long, help_heading = "Build Metadata", default_value_t = String::new())]
    pub prereq_args: String,

    ///Custom field stored in the manifest, as key=value.
    ///Can be specified more than once.
    #[arg(long = "custom", help_heading = "Build Metadata", value_parser = parse_key_val)]
    pub custom_fields: Vec<(String, String)>,

    ///File listing build relative paths to leave out of the manifest.
    #[arg(long, help_heading = "Build Metadata")]
    pub ignore_list: Option<PathBuf>,

    ///File listing per file attributes and install tags.
    #[arg(long, help_heading = "Build Metadata")]
    pub attribute_list: Option<PathBuf>,

    ///Cloud chunks older than this many days are not reused.
    #[arg(long, help_heading = "Tuning Parameters")]
    pub data_age_threshold: Option<f64>,

    ///Maximum number of unfinished data scanners (5 to 500).
    #[arg(long, help_heading = "Tuning Parameters")]
    pub scanner_backlog: Option<usize>,

    ///Sets the maximum number of worker threads to use.
    ///Defaults to all available logical cores.
    #[arg(short, long, help_heading = "Tuning Parameters")]
    pub threads: Option<usize>,

    ///Saves the manifest in the binary format instead of JSON.
    #[arg(long, help_heading = "Tuning Parameters")]
    pub binary: bool,
}

#[derive(Clone, ClapArgs, Debug)]
pub struct CompactifyArgs {
    ///Cloud directory to clean up.
    #[arg(long, help_heading = "Primary Options")]
    pub cloud_dir: PathBuf,

    ///Unreferenced files must be at least this many days old to be deleted.
    #[arg(long, help_heading = "Primary Options")]
    pub data_age_threshold: Option<f64>,

    ///Only report what would be deleted.
    #[arg(long, help_heading = "Primary Options")]
    pub preview: bool,

    ///Writes the cloud relative paths of deleted files to this file.
    #[arg(long, help_heading = "Primary Options")]
    pub deleted_list: Option<PathBuf>,
}

#[derive(Clone, ClapArgs, Debug)]
pub struct VerifyArgs {
    ///Directory searched for chunks, chunk databases and manifests.
    #[arg(long, help_heading = "Primary Options")]
    pub search_path: PathBuf,

    ///File that receives the paths of every failing file.
    #[arg(short, long, help_heading = "Primary Options")]
    pub output: PathBuf,

    ///Sets the maximum number of worker threads to use.
    #[arg(short, long, help_heading = "Tuning Parameters")]
    pub threads: Option<usize>,
}

#[derive(Clone, ClapArgs, Debug)]
pub struct EnumerateArgs {
    ///Manifest or chunk database to list.
    #[arg(short, long, help_heading = "Primary Options")]
    pub input: PathBuf,

    ///File that receives the listing.
    #[arg(short, long, help_heading = "Primary Options")]
    pub output: PathBuf,

    ///Appends the size in bytes to each line.
    #[arg(long, help_heading = "Primary Options")]
    pub include_sizes: bool,
}

#[derive(Clone, ClapArgs, Debug)]
pub struct PackageArgs {
    ///Manifest whose chunks are packaged.
    #[arg(long, help_heading = "Primary Options")]
    pub manifest: PathBuf,

    ///Cloud directory the chunks are read from.
    #[arg(long, help_heading = "Primary Options")]
    pub cloud_dir: PathBuf,

    ///Path of the chunk database to write.
    #[arg(short, long, help_heading = "Primary Options")]
    pub output: PathBuf,

    ///Largest size of one chunk database file (e.g., "500MB", "4GiB").
    ///The output is split into numbered parts when exceeded.
    #[arg(long, help_heading = "Primary Options")]
    pub max_output_file_size: Option<ByteSize>,
}

/// Parses a `key=value` pair for `--custom`.
fn parse_key_val(input: &str) -> Result<(String, String), String> {
    let (key, value) = input
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, found '{input}'"))?;
    if key.is_empty() {
        return Err(format!("missing key in '{input}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

impl GenerateArgs {
    pub fn custom_field_map(&self) -> BTreeMap<String, String> {
        self.custom_fields.iter().cloned().collect()
    }
}

/// Returns the matches of the chosen subcommand, or the top level ones.
fn command_matches(matches: &ArgMatches) -> &ArgMatches {
    matches
        .subcommand()
        .map(|(_, sub_matches)| sub_matches)
        .unwrap_or(matches)
}

fn check_exists(path: &Path, what: &str) -> Result<(), CliError> {
    if !path.exists() {
        return Err(CliError::InvalidPath(format!(
            "{what} does not exist: {}",
            path.display()
        )));
    }
    Ok(())
}

fn check_age(days: Option<f64>) -> Result<(), CliError> {
    if let Some(days) = days
        && !(days.is_finite() && days >= 0.0)
    {
        return Err(CliError::InvalidValue(format!(
            "The data age threshold must be a non negative number of days, got {days}."
        )));
    }
    Ok(())
}

/// Validates the command-line arguments provided by the user.
///
/// # Arguments
///
/// * `args`: The parsed and merged command-line arguments.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` if all argument combinations are valid.
/// - `Err(CliError)` if any validation check fails.
///
/// # Errors
///
/// Returns an error in the following cases:
/// - An input path does not exist.
/// - The build root or cloud directory is not a directory.
/// - The manifest name is empty or contains a path separator.
/// - An age threshold is negative.
/// - The package size limit is zero.
pub fn validate_args(args: &Args) -> Result<(), CliError> {
    match &args.command {
        Command::Generate(generate) => {
            check_exists(&generate.build_root, "Build root")?;
            if !generate.build_root.is_dir() {
                return Err(CliError::InvalidPath(format!(
                    "Build root must be a directory: {}",
                    generate.build_root.display()
                )));
            }
            if generate.cloud_dir.is_file() {
                return Err(CliError::InvalidPath(format!(
                    "Cloud directory is a file: {}",
                    generate.cloud_dir.display()
                )));
            }
            if generate.manifest.is_empty() || generate.manifest.contains(['/', '\\']) {
                return Err(CliError::InvalidValue(
                    "--manifest must be a plain file name.".to_string(),
                ));
            }
            if let Some(list) = &generate.ignore_list {
                check_exists(list, "Ignore list")?;
            }
            if let Some(list) = &generate.attribute_list {
                check_exists(list, "Attribute list")?;
            }
            if generate.prereq_path.is_empty() && !generate.prereq_args.is_empty() {
                return Err(CliError::MissingFlag(
                    "--prereq-path is required when --prereq-args is given.".to_string(),
                ));
            }
            check_age(generate.data_age_threshold)?;
        }
        Command::Compactify(compactify) => {
            check_exists(&compactify.cloud_dir, "Cloud directory")?;
            check_age(compactify.data_age_threshold)?;
        }
        Command::Verify(verify) => {
            check_exists(&verify.search_path, "Search path")?;
            if verify.output.is_dir() {
                return Err(CliError::InvalidPath(
                    "The output path must be a file, not a directory.".to_string(),
                ));
            }
        }
        Command::Enumerate(enumerate) => {
            check_exists(&enumerate.input, "Input")?;
            if enumerate.input == enumerate.output {
                return Err(CliError::ConflictingArguments(
                    "Input and output must be different files.".to_string(),
                ));
            }
        }
        Command::Package(package) => {
            check_exists(&package.manifest, "Manifest")?;
            check_exists(&package.cloud_dir, "Cloud directory")?;
            if package.max_output_file_size.is_some_and(|size| size.as_u64() == 0) {
                return Err(CliError::InvalidValue(
                    "--max-output-file-size must be larger than zero.".to_string(),
                ));
            }
        }
    }

    Ok(())
}

/// Merges settings from the configuration file with command-line arguments.
///
/// Command-line arguments take precedence. Every configurable option not
/// given on the command line takes the value from `config`.
///
/// # Arguments
///
/// * `config`: Settings loaded from the configuration file.
/// * `args`: Parsed command-line arguments, updated in place and returned.
/// * `matches`: Used to determine which arguments were actually provided
///   by the user on the command line.
///
/// # Returns
///
/// The `Args` the application runs with.
pub fn merge_config_and_args(
    config: &BuildPatchConfig,
    mut args: Args,
    matches: &ArgMatches,
) -> Args {
    let sub_matches = command_matches(matches);
    //Flags with defaults always have a value, so check where it came from.
    let arg_was_present = |name: &str| {
        [matches, sub_matches]
            .iter()
            .any(|m| {
                m.try_get_raw(name).is_ok()
                    && m.value_source(name) == Some(ValueSource::CommandLine)
            })
    };

    if !arg_was_present("verbose") {
        args.verbose = config.verbose;
    }
    if !arg_was_present("quiet") {
        args.quiet = config.quiet_output;
    }

    let config_threads = (config.threads > 0).then_some(config.threads);
    match &mut args.command {
        Command::Generate(generate) => {
            if !arg_was_present("threads") {
                generate.threads = config_threads;
            }
            if !arg_was_present("scanner_backlog") {
                generate.scanner_backlog = Some(config.scanner_backlog);
            }
            if !arg_was_present("data_age_threshold") {
                generate.data_age_threshold = Some(config.data_age_threshold);
            }
            if !arg_was_present("binary") {
                generate.binary = config.binary_manifest;
            }
        }
        Command::Compactify(compactify) => {
            if !arg_was_present("data_age_threshold") {
                compactify.data_age_threshold = Some(config.compactify_age_threshold);
            }
        }
        Command::Verify(verify) => {
            if !arg_was_present("threads") {
                verify.threads = config_threads;
            }
        }
        Command::Enumerate(_) | Command::Package(_) => {}
    }

    args
}

#[cfg(test)]
mod tests {
    use clap::{CommandFactory, FromArgMatches};

    use super::*;

    fn parse(argv: &[&str]) -> (Args, ArgMatches) {
        let matches = Args::command().try_get_matches_from(argv).unwrap();
        let args = Args::from_arg_matches(&matches).unwrap();
        (args, matches)
    }

    #[test]
    fn test_custom_fields_parse() {
        let (args, _) = parse(&[
            "buildpatchtool", "generate", "--build-root", "b", "--cloud-dir", "c",
            "--manifest", "m.manifest", "--custom", "Channel=Beta", "--custom", "Empty=",
        ]);
        let Command::Generate(generate) = args.command else {
            panic!("expected generate");
        };
        let fields = generate.custom_field_map();
        assert_eq!(fields["Channel"], "Beta");
        assert_eq!(fields["Empty"], "");
        assert!(parse_key_val("novalue").is_err());
    }

    #[test]
    fn test_command_line_overrides_config() {
        let config = BuildPatchConfig {
            threads: 3,
            scanner_backlog: 20,
            binary_manifest: true,
            verbose: true,
            ..Default::default()
        };
        let (args, matches) = parse(&[
            "buildpatchtool", "generate", "--build-root", "b", "--cloud-dir", "c",
            "--manifest", "m.manifest", "--scanner-backlog", "100",
        ]);
        let merged = merge_config_and_args(&config, args, &matches);
        assert!(merged.verbose);
        let Command::Generate(generate) = merged.command else {
            panic!("expected generate");
        };
        assert_eq!(generate.scanner_backlog, Some(100));
        assert_eq!(generate.threads, Some(3));
        assert!(generate.binary);
    }

    #[test]
    fn test_compactify_uses_its_own_age() {
        let config = BuildPatchConfig::default();
        let (args, matches) = parse(&["buildpatchtool", "compactify", "--cloud-dir", "c", "-q"]);
        let merged = merge_config_and_args(&config, args, &matches);
        assert!(merged.quiet);
        let Command::Compactify(compactify) = merged.command else {
            panic!("expected compactify");
        };
        assert_eq!(compactify.data_age_threshold, Some(config.compactify_age_threshold));
    }

    #[test]
    fn test_negative_age_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cloud = dir.path().display().to_string();
        let (args, _) = parse(&[
            "buildpatchtool", "compactify", "--cloud-dir", cloud.as_str(), "--data-age-threshold=-1",
        ]);
        assert!(matches!(validate_args(&args), Err(CliError::InvalidValue(_))));
    }
}
