//! Implements the chunk packaging mode.

use buildpatch::package_chunks;
use tracing::info;

use crate::{arg_handling::PackageArgs, error_handling::CliError};

/// Packs the chunks of a manifest into one or more chunk databases.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` once every part was written.
/// - `Err(CliError)` if the manifest or a chunk could not be read, or a
///   part could not be written.
pub fn run_package(args: &PackageArgs) -> Result<(), CliError> {
    let parts = package_chunks(
        &args.manifest,
        &args.cloud_dir,
        &args.output,
        args.max_output_file_size.map(|size| size.as_u64()),
    )?;

    for part in &parts {
        info!("{}", part.display());
    }
    Ok(())
}
