//! Checks chunk data and the manifests that depend on it.
//!
//! Every chunk file and chunk database under the search path is loaded
//! and checked against its own header in parallel. Afterwards each
//! manifest is checked for references to chunks that failed, or that were
//! not found at all.

use std::{
    fs,
    path::{Path, PathBuf},
};

use dashmap::DashMap;
use rayon::iter::{IntoParallelRefIterator, ParallelIterator};
use tracing::{debug, error, info};
use walkdir::WalkDir;

use crate::{
    chunk_data::{load_chunk_file, parse_chunk, verify_chunk},
    chunk_database::ChunkDatabaseReader,
    guid::Guid,
    lib_error_handling::BuildPatchError,
    manifest::Manifest,
    utils::{CHUNK_EXTENSION, CHUNKDB_EXTENSION, MANIFEST_EXTENSION, get_guid_from_filename},
};

/// Chunk GUIDs seen during a verify run, with the file they came from.
#[derive(Debug, Default)]
struct ChunkSets {
    good: DashMap<Guid, PathBuf>,
    bad: DashMap<Guid, PathBuf>,
}

fn has_extension(path: &Path, extension: &str) -> bool {
    path.extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(extension))
}

/// Verifies one `.chunk` file. The GUID in the header must match the name.
fn verify_chunk_file(path: &Path, sets: &ChunkSets) -> bool {
    let name_guid = get_guid_from_filename(path);
    match load_chunk_file(path) {
        Ok((header, _)) if name_guid.is_none_or(|guid| guid == header.guid) => {
            sets.good.insert(header.guid, path.to_path_buf());
            true
        }
        Ok((header, _)) => {
            error!(
                "{}: header GUID {} does not match the file name.",
                path.display(),
                header.guid
            );
            sets.bad.insert(header.guid, path.to_path_buf());
            if let Some(guid) = name_guid {
                sets.bad.insert(guid, path.to_path_buf());
            }
            false
        }
        Err(e) => {
            error!("{}: {e}", path.display());
            if let Some(guid) = name_guid {
                sets.bad.insert(guid, path.to_path_buf());
            }
            false
        }
    }
}

/// Verifies every chunk inside a chunk database.
fn verify_chunk_database(path: &Path, sets: &ChunkSets) -> bool {
    let mut reader = match ChunkDatabaseReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            error!("{}: {e}", path.display());
            return false;
        }
    };

    let contents = reader.header().contents.clone();
    let mut all_good = true;
    for location in &contents {
        let checked = reader
            .read_chunk_bytes(location)
            .and_then(|bytes| parse_chunk(&bytes))
            .and_then(|(header, data)| {
                verify_chunk(&header, &data)?;
                if header.guid != location.guid {
                    return Err(BuildPatchError::InvalidHeaderError(format!(
                        "Table lists {} but the chunk header says {}",
                        location.guid, header.guid
                    )));
                }
                Ok(())
            });

        match checked {
            Ok(()) => {
                sets.good.insert(location.guid, path.to_path_buf());
            }
            Err(e) => {
                error!("{} chunk {}: {e}", path.display(), location.guid);
                sets.bad.insert(location.guid, path.to_path_buf());
                all_good = false;
            }
        }
    }
    all_good
}

/// Checks a manifest's references against the verified chunk sets.
fn verify_manifest(path: &Path, sets: &ChunkSets) -> bool {
    let manifest = match Manifest::load_from_file(path) {
        Ok(manifest) => manifest,
        Err(e) => {
            error!("{}: {e}", path.display());
            return false;
        }
    };

    let mut bad_data = 0usize;
    let mut missing_data = 0usize;
    for guid in manifest.get_data_list() {
        if sets.bad.contains_key(&guid) {
            bad_data += 1;
        } else if !sets.good.contains_key(&guid) {
            missing_data += 1;
        }
    }

    if bad_data > 0 {
        error!("{}: bad data referenced ({bad_data} chunks).", path.display());
    }
    if missing_data > 0 {
        error!("{}: missing data referenced ({missing_data} chunks).", path.display());
    }
    bad_data == 0 && missing_data == 0
}

/// Verifies all chunk data and manifests under `search_path`.
///
/// # Arguments
///
/// * `search_path`: Directory searched recursively.
/// * `output_file`: Receives the paths of every failing file, one per
///   line. Written even when nothing failed.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(true)` if every file passed.
/// - `Ok(false)` if any chunk, chunk database or manifest failed.
/// - `Err(BuildPatchError)` if the search path could not be walked or the
///   output could not be written.
pub fn verify_chunk_data(search_path: &Path, output_file: &Path) -> Result<bool, BuildPatchError> {
    let mut data_files = Vec::new();
    let mut manifests = Vec::new();
    for entry in WalkDir::new(search_path).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.into_path();
        if has_extension(&path, CHUNK_EXTENSION) || has_extension(&path, CHUNKDB_EXTENSION) {
            data_files.push(path);
        } else if has_extension(&path, MANIFEST_EXTENSION) {
            manifests.push(path);
        }
    }

    info!(
        "Verifying {} data files and {} manifests in {}.",
        data_files.len(),
        manifests.len(),
        search_path.display()
    );

    let sets = ChunkSets::default();
    let mut failed: Vec<PathBuf> = data_files
        .par_iter()
        .filter(|path| {
            let passed = if has_extension(path, CHUNKDB_EXTENSION) {
                verify_chunk_database(path, &sets)
            } else {
                verify_chunk_file(path, &sets)
            };
            debug!("{}: {}", path.display(), if passed { "OK" } else { "FAILED" });
            !passed
        })
        .cloned()
        .collect();

    for path in &manifests {
        if !verify_manifest(path, &sets) {
            failed.push(path.clone());
        }
    }
    failed.sort();

    let mut text: String = failed
        .iter()
        .map(|path| path.display().to_string())
        .collect::<Vec<_>>()
        .join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(output_file, text)?;

    info!(
        "Verified {} good and {} bad chunks. {} files failed.",
        sets.good.len(),
        sets.bad.len(),
        failed.len()
    );
    Ok(failed.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk_data::{serialize_chunk, sha1_digest},
        chunk_database::save_chunk_database,
    };

    #[test]
    fn test_guid_name_mismatch_is_bad() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![3u8; 64];
        let inner = Guid::new(1, 2, 3, 4);
        let named = Guid::new(5, 6, 7, 8);
        let path = dir.path().join(format!("{named}.chunk"));
        fs::write(&path, serialize_chunk(inner, 0, sha1_digest(&data), &data).unwrap()).unwrap();

        let sets = ChunkSets::default();
        assert!(!verify_chunk_file(&path, &sets));
        assert!(sets.bad.contains_key(&named));
        assert!(sets.good.is_empty());
    }

    #[test]
    fn test_chunk_database_entries_checked() {
        let dir = tempfile::tempdir().unwrap();
        let good_data = vec![1u8; 100];
        let good = Guid::new(1, 1, 1, 1);
        let bad = Guid::new(2, 2, 2, 2);
        let mut bad_bytes = serialize_chunk(bad, 0, sha1_digest(&good_data), &[9u8; 100]).unwrap();
        let last = bad_bytes.len() - 1;
        bad_bytes[last] ^= 0xFF;

        let path = dir.path().join("pack.chunkdb");
        save_chunk_database(
            &path,
            &[
                (good, serialize_chunk(good, 0, sha1_digest(&good_data), &good_data).unwrap()),
                (bad, bad_bytes),
            ],
        )
        .unwrap();

        let sets = ChunkSets::default();
        assert!(!verify_chunk_database(&path, &sets));
        assert!(sets.good.contains_key(&good));
        assert!(sets.bad.contains_key(&bad));
    }

    #[test]
    fn test_empty_search_path_passes() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("failed.txt");
        assert!(verify_chunk_data(dir.path(), &output).unwrap());
        assert_eq!(fs::read_to_string(output).unwrap(), "");
    }
}
