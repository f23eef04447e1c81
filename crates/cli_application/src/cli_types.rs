//! Defines core data structures for the CLI application.
//!
//! This module holds the identifiers used to locate the configuration and
//! log directories, and the configuration struct loaded from disk.

use serde::{Deserialize, Serialize};

/// Identifies the application to `directories` and `confy`.
///
/// # Fields
///
/// * `qualifier`: Reverse domain qualifier of the project.
/// * `organization`: Organization name used in platform paths.
/// * `application`: Application name used in platform paths.
/// * `config_name`: File stem of the configuration file.
pub struct AppIdentifier {
    pub qualifier: &'static str,
    pub organization: &'static str,
    pub application: &'static str,
    pub config_name: &'static str,
}

pub const APPIDENTIFIER: AppIdentifier = AppIdentifier {
    qualifier: "com",
    organization: "buildpatch",
    application: "buildpatchtool",
    config_name: "buildpatchtool",
};

/// Settings read from the on disk configuration file.
///
/// Every value can be overridden by the matching command-line flag.
///
/// # Fields
///
/// * `threads`: Worker threads for scanning and verification. 0 lets
///   Rayon decide.
/// * `scanner_backlog`: Maximum number of unfinished scanners.
/// * `data_age_threshold`: Days after which cloud chunks are no longer
///   reused during generation.
/// * `compactify_age_threshold`: Days an unreferenced data file must be
///   untouched before compactify deletes it.
/// * `binary_manifest`: Save generated manifests in the binary format.
/// * `verbose`: Print debug output to the console.
/// * `quiet_output`: Print nothing to the console.
/// * `log_retention_days`: Age in days at which log files are removed.
///   0 keeps logs forever.
/// * `log_level`: Verbosity of the log file, or "off".
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct BuildPatchConfig {
    pub threads: usize,
    pub scanner_backlog: usize,
    pub data_age_threshold: f64,
    pub compactify_age_threshold: f64,
    pub binary_manifest: bool,
    pub verbose: bool,
    pub quiet_output: bool,
    pub log_retention_days: u16,
    pub log_level: String,
}

impl Default for BuildPatchConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            scanner_backlog: buildpatch::DEFAULT_SCANNER_BACKLOG,
            data_age_threshold: buildpatch::DEFAULT_DATA_AGE_THRESHOLD,
            compactify_age_threshold: buildpatch::DEFAULT_COMPACTIFY_AGE_THRESHOLD,
            binary_manifest: false,
            verbose: false,
            quiet_output: false,
            log_retention_days: 7,
            log_level: String::from("error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: BuildPatchConfig = serde_json::from_str(r#"{"threads": 4}"#).unwrap();
        assert_eq!(config.threads, 4);
        assert_eq!(config.scanner_backlog, buildpatch::DEFAULT_SCANNER_BACKLOG);
        assert_eq!(config.log_level, "error");
    }
}
