//! Implements the cloud directory compactify mode.

use buildpatch::{CompactifySettings, DEFAULT_COMPACTIFY_AGE_THRESHOLD, compactify_cloud_directory};
use tracing::info;

use crate::{arg_handling::CompactifyArgs, error_handling::CliError};

/// Deletes, or in preview lists, unreferenced data older than the
/// threshold.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` once every data file was considered. Individual delete
///   failures are logged by the library and do not fail the run.
/// - `Err(CliError)` if a manifest could not be read or the directory
///   could not be walked.
pub fn run_compactify(args: &CompactifyArgs) -> Result<(), CliError> {
    let mut settings = CompactifySettings::new(&args.cloud_dir);
    settings.data_age_threshold = args
        .data_age_threshold
        .unwrap_or(DEFAULT_COMPACTIFY_AGE_THRESHOLD);
    settings.preview = args.preview;
    settings.deleted_list = args.deleted_list.clone();

    let summary = compactify_cloud_directory(&settings)?;
    if let Some(list) = &settings.deleted_list {
        info!(
            "Wrote {} entries to {}.",
            summary.deleted_files.len(),
            list.display()
        );
    }
    Ok(())
}
