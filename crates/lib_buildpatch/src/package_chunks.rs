//! Packs the chunks of a manifest into chunk database files.

use std::{
    fs,
    path::{Path, PathBuf},
};

use tracing::{debug, info};

use crate::{
    chunk_database::{ChunkDatabaseHeader, save_chunk_database},
    guid::Guid,
    lib_error_handling::BuildPatchError,
    manifest::Manifest,
    utils::{CHUNKDB_EXTENSION, human_readable_size},
};

/// Output path of part `part` of `output`.
///
/// A single part keeps the requested name, more parts are numbered from
/// one as `Name.partNN.chunkdb`.
fn part_path(output: &Path, part: usize, num_parts: usize) -> PathBuf {
    if num_parts <= 1 {
        return output.with_extension(CHUNKDB_EXTENSION);
    }
    let stem = output
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    output.with_file_name(format!("{stem}.part{part:02}.{CHUNKDB_EXTENSION}"))
}

/// Writes every chunk `manifest_path` references into chunk databases.
///
/// # Arguments
///
/// * `manifest_path`: Manifest whose data is packaged.
/// * `cloud_dir`: Directory the chunk files are read from.
/// * `output`: Path of the chunk database to create.
/// * `max_output_file_size`: Largest size of one database file. The
///   output is split into numbered parts when the chunks do not fit.
///   A single chunk larger than the limit still gets its own part.
///
/// # Returns
///
/// A `Result` containing the paths of the written files, in order.
pub fn package_chunks(
    manifest_path: &Path,
    cloud_dir: &Path,
    output: &Path,
    max_output_file_size: Option<u64>,
) -> Result<Vec<PathBuf>, BuildPatchError> {
    let manifest = Manifest::load_from_file(manifest_path)?;
    let limit = max_output_file_size.unwrap_or(u64::MAX);

    let mut parts: Vec<Vec<(Guid, PathBuf, u64)>> = vec![Vec::new()];
    let mut part_data_size = 0u64;
    for guid in manifest.get_data_list() {
        let path = manifest.get_data_filename(cloud_dir, &guid).ok_or_else(|| {
            BuildPatchError::ManifestDecodeError(format!(
                "Manifest references {guid} without listing it"
            ))
        })?;
        let size = fs::metadata(&path)?.len();

        let current = parts.len() - 1;
        let projected = ChunkDatabaseHeader::header_size_for(parts[current].len() + 1)
            + part_data_size
            + size;
        if !parts[current].is_empty() && projected > limit {
            parts.push(Vec::new());
            part_data_size = 0;
        }
        part_data_size += size;
        if let Some(part) = parts.last_mut() {
            part.push((guid, path, size));
        }
    }

    let num_parts = parts.len();
    let mut written = Vec::with_capacity(num_parts);
    for (idx, part) in parts.into_iter().enumerate() {
        let chunks = part
            .into_iter()
            .map(|(guid, path, _)| -> Result<(Guid, Vec<u8>), BuildPatchError> {
                Ok((guid, fs::read(&path)?))
            })
            .collect::<Result<Vec<_>, BuildPatchError>>()?;

        let path = part_path(output, idx + 1, num_parts);
        let header = save_chunk_database(&path, &chunks)?;
        debug!(
            "Wrote {} with {} chunks ({}).",
            path.display(),
            header.contents.len(),
            human_readable_size(header.data_size)
        );
        written.push(path);
    }

    info!(
        "Packaged {} chunks of {} into {} files.",
        manifest.get_data_list().len(),
        manifest_path.display(),
        written.len()
    );
    Ok(written)
}
