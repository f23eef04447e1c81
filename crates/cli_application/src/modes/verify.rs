//! Implements the chunk data verification mode.

use buildpatch::verify_chunk_data;
use tracing::{error, info};

use crate::{arg_handling::VerifyArgs, error_handling::CliError};

/// Verifies every chunk, chunk database and manifest under the search path.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` if every file passed.
/// - `Err(CliError::OperationFailed)` if any file failed. The failing
///   paths are listed in the output file.
/// - `Err(CliError)` for any other failure.
pub fn run_verify(args: &VerifyArgs) -> Result<(), CliError> {
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(args.threads.unwrap_or(0))
        .build()
        .map_err(|e| CliError::OperationFailed(format!("Failed to create thread pool: {}", e)))?;

    let passed = pool.install(|| verify_chunk_data(&args.search_path, &args.output))?;
    if passed {
        info!("All data under {} is valid.", args.search_path.display());
        Ok(())
    } else {
        error!("Failing files are listed in {}.", args.output.display());
        Err(CliError::OperationFailed(
            "Verification found corrupt or missing data.".to_string(),
        ))
    }
}
