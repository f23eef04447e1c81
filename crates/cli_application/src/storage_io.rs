//! Provides the file system operations of the application itself.
//!
//! This covers loading the configuration file, writing a commented default
//! one on first run, and pruning old log files.

use std::{
    fs::{self, metadata, read_dir, remove_file},
    time::{Duration, SystemTime},
};

use tracing::debug;

use crate::{
    cli_types::{APPIDENTIFIER, BuildPatchConfig},
    error_handling::{CliError, log_directory},
};

/// The commented configuration written on first run.
const DEFAULT_CONFIG_WITH_COMMENTS: &str = r#"
# Sets the maximum number of worker threads used for scanning and
# verification.
# 0 means use all available cores.
threads = 0

# Sets how many data scanners may be unfinished at once during generation.
# Larger values use more memory but keep all cores busy.
# Valid range is 5 to 500.
# Default = 75
scanner_backlog = 75

# Cloud chunks older than this many days are not reused when generating a
# manifest. Decimal values are allowed.
# Default = 5.0
data_age_threshold = 5.0

# Unreferenced data files must be at least this many days old before
# compactify deletes them.
# Default = 2.0
compactify_age_threshold = 2.0

# Enable (true) to save generated manifests in the binary format instead
# of JSON.
# Default = false
binary_manifest = false

# Activates verbose output for detailed diagnostic information.
# Default = false
verbose = false

# Whether to print anything to console. True will disable printing to console
# and false will enable.
# Default = false
quiet_output = false

# Specifies the amount of days the application will retain log files. Any log
# file found to be older than the retention period, upon the application being
# run, will be removed. A value of 0 will keep logs forever.
# Default = 7
log_retention_days = 7

# Sets the log file verbosity level when enabled.
# - error will only log errors.
# - warning includes warning messages and the above messages (errors)
# - info includes info messages and the above messages (errors and warnings)
# - debug includes debug messages and the above messages
#   (errors, warnings and info)
# - off disables the creation of a log file and won't write any messages to one
#   if one exists
# Default = "error"
log_level = "error"
"#;

/// Loads the application configuration, creating a default one if needed.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(BuildPatchConfig)` containing the loaded application settings.
/// - `Err(CliError)` if the file could not be created, read or parsed.
pub fn load_config() -> Result<BuildPatchConfig, CliError> {
    let app_name = APPIDENTIFIER.application;

    let config_path = confy::get_configuration_file_path(app_name, APPIDENTIFIER.config_name)?;

    if !config_path.exists() {
        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&config_path, DEFAULT_CONFIG_WITH_COMMENTS)?;
        debug!("Wrote default config to {}.", config_path.display());
    }

    Ok(confy::load(app_name, APPIDENTIFIER.config_name)?)
}

/// Deletes log files older than `retention_days`.
///
/// A value of 0 keeps all logs.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` if the cleanup completed or nothing needed removing.
/// - `Err(CliError)` if the log directory could not be read or a file
///   could not be removed.
pub fn cleanup_old_logs(retention_days: u16) -> Result<(), CliError> {
    if retention_days == 0 {
        return Ok(());
    }

    let log_dir = log_directory()?;
    if !log_dir.exists() {
        return Ok(());
    }

    let now = SystemTime::now();
    let retention_duration = Duration::from_secs(u64::from(retention_days) * 24 * 60 * 60);

    for log in read_dir(log_dir)? {
        let path = log?.path();

        if path.is_file()
            && path.to_string_lossy().contains("debug.log")
            && let Ok(metadata) = metadata(&path)
            && let Ok(modified) = metadata.modified()
            && let Ok(age) = now.duration_since(modified)
            && age > retention_duration
        {
            remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_text_parses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("buildpatchtool.toml");
        fs::write(&path, DEFAULT_CONFIG_WITH_COMMENTS).unwrap();
        let parsed: BuildPatchConfig = confy::load_path(&path).unwrap();
        let defaults = BuildPatchConfig::default();
        assert_eq!(parsed.scanner_backlog, defaults.scanner_backlog);
        assert_eq!(parsed.data_age_threshold, defaults.data_age_threshold);
        assert_eq!(parsed.log_level, defaults.log_level);
    }
}
