//! Implements the manifest generation mode.
//!
//! This module turns the `generate` arguments into library settings, runs
//! the chunking pipeline and prints a summary of the result.

use buildpatch::{
    GenerationSettings, GenerationSummary, ManifestFormat, generate_chunks_manifest_from_directory,
    human_readable_size,
};
use tracing::info;

use crate::{arg_handling::GenerateArgs, error_handling::CliError};

/// Builds the library settings for a generate run.
fn build_settings(args: &GenerateArgs) -> GenerationSettings {
    let mut settings = GenerationSettings::new(&args.build_root, &args.cloud_dir, &args.manifest)
        .app_id(args.app_id)
        .app_name(&args.app_name)
        .build_version(&args.build_version)
        .launch(&args.launch_exe, &args.launch_command)
        .prerequisites(
            args.prereq_ids.clone(),
            &args.prereq_name,
            &args.prereq_path,
            &args.prereq_args,
        )
        .custom_fields(args.custom_field_map())
        .worker_threads(args.threads.unwrap_or(0))
        .output_format(if args.binary {
            ManifestFormat::Binary
        } else {
            ManifestFormat::Json
        });

    if let Some(days) = args.data_age_threshold {
        settings = settings.data_age_threshold(days);
    }
    if let Some(backlog) = args.scanner_backlog {
        settings = settings.scanner_backlog(backlog);
    }
    if let Some(list) = &args.ignore_list {
        settings = settings.ignore_list_file(list);
    }
    if let Some(list) = &args.attribute_list {
        settings = settings.attribute_list_file(list);
    }
    settings
}

fn print_summary(summary: &GenerationSummary) {
    info!("Manifest saved to {}", summary.manifest_path.display());
    info!(
        "{} files, {} of build data.",
        summary.num_files,
        human_readable_size(summary.build_size)
    );
    info!(
        "{} new chunks, {} reused chunks ({} matched).",
        summary.new_chunks,
        summary.reused_chunks,
        human_readable_size(summary.matched_bytes)
    );
    info!(
        "{} scanners over {} layers, {} hash collisions, {:.2?} elapsed.",
        summary.num_scanners, summary.num_layers, summary.hash_collisions, summary.elapsed
    );
}

/// Chunks the build root and saves a manifest into the cloud directory.
///
/// # Arguments
///
/// * `args`: The merged `generate` arguments.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(())` if the manifest was saved.
/// - `Err(CliError)` if generation failed. No manifest is written in
///   that case.
pub fn run_generate(args: &GenerateArgs) -> Result<(), CliError> {
    let settings = build_settings(args);
    let summary = generate_chunks_manifest_from_directory(&settings)?;
    print_summary(&summary);
    Ok(())
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;
    use crate::arg_handling::{Args, Command};

    #[test]
    fn test_settings_target_cloud_manifest() {
        let args = Args::parse_from([
            "buildpatchtool", "generate", "--build-root", "build", "--cloud-dir", "cloud",
            "--manifest", "Game.manifest", "--binary",
        ]);
        let Command::Generate(generate) = args.command else {
            panic!("expected generate");
        };
        let settings = build_settings(&generate);
        assert_eq!(
            settings.manifest_path(),
            std::path::Path::new("cloud").join("Game.manifest")
        );
    }
}
