//! Implements the data enumeration mode.

use buildpatch::enumerate_manifest_data;

use crate::{arg_handling::EnumerateArgs, error_handling::CliError};

/// Writes the data listing of a manifest or chunk database.
pub fn run_enumerate(args: &EnumerateArgs) -> Result<(), CliError> {
    enumerate_manifest_data(&args.input, &args.output, args.include_sizes)?;
    Ok(())
}
