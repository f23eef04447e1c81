//! Lists the data a manifest or chunk database is made of.

use std::{fmt::Write as _, fs, path::Path};

use tracing::info;

use crate::{
    chunk_data::parse_chunk,
    chunk_database::ChunkDatabaseReader,
    lib_error_handling::BuildPatchError,
    manifest::Manifest,
    utils::{CHUNKDB_EXTENSION, relative_path_string},
};

/// Writes a listing of the data referenced by `input` to `output`.
///
/// For a manifest, one line per referenced data file with its path
/// relative to the cloud directory. For a chunk database, one line per
/// contained chunk with its GUID, rolling hash and SHA-1. With
/// `include_sizes`, each line ends in a tab and the size in bytes.
///
/// # Returns
///
/// A `Result` containing the number of lines written.
pub fn enumerate_manifest_data(
    input: &Path,
    output: &Path,
    include_sizes: bool,
) -> Result<usize, BuildPatchError> {
    let is_chunk_database = input
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case(CHUNKDB_EXTENSION));

    let lines = if is_chunk_database {
        enumerate_chunk_database(input, include_sizes)?
    } else {
        enumerate_manifest(input, include_sizes)?
    };

    let mut text = lines.join("\n");
    if !text.is_empty() {
        text.push('\n');
    }
    fs::write(output, text)?;

    info!("Wrote {} entries for {} to {}.", lines.len(), input.display(), output.display());
    Ok(lines.len())
}

fn enumerate_manifest(input: &Path, include_sizes: bool) -> Result<Vec<String>, BuildPatchError> {
    let manifest = Manifest::load_from_file(input)?;
    let cloud_root = Path::new("");

    let mut lines = Vec::new();
    for guid in manifest.get_data_list() {
        let (Some(path), Some(info)) = (
            manifest.get_data_filename(cloud_root, &guid),
            manifest.get_chunk_info(&guid),
        ) else {
            return Err(BuildPatchError::ManifestDecodeError(format!(
                "Manifest references {guid} without listing it"
            )));
        };

        let mut line = relative_path_string(cloud_root, &path);
        if include_sizes {
            let _ = write!(line, "\t{}", info.file_size);
        }
        lines.push(line);
    }
    Ok(lines)
}

fn enumerate_chunk_database(input: &Path, include_sizes: bool) -> Result<Vec<String>, BuildPatchError> {
    let mut reader = ChunkDatabaseReader::open(input)?;
    let contents = reader.header().contents.clone();

    let mut lines = Vec::with_capacity(contents.len());
    for location in &contents {
        let (header, _) = parse_chunk(&reader.read_chunk_bytes(location)?)?;
        let mut line = format!(
            "{}\t{:016X}\t{}",
            location.guid,
            header.rolling_hash,
            hex::encode_upper(header.sha_hash)
        );
        if include_sizes {
            let _ = write!(line, "\t{}", location.byte_size);
        }
        lines.push(line);
    }
    Ok(lines)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        chunk_data::{serialize_chunk, sha1_digest},
        chunk_database::save_chunk_database,
        guid::Guid,
        lib_structs::{ChunkInfoData, ChunkPartData, FileManifestData},
        manifest::ManifestFormat,
    };

    #[test]
    fn test_manifest_listing_uses_cloud_relative_paths() {
        let dir = tempfile::tempdir().unwrap();
        let guid = Guid::new(0xA, 0xB, 0xC, 0xD);
        let mut manifest = Manifest::new();
        manifest.file_manifest_list.push(FileManifestData {
            filename: "f".to_string(),
            file_chunk_parts: vec![ChunkPartData { guid, offset: 0, size: 4 }],
            ..Default::default()
        });
        manifest.chunk_list.push(ChunkInfoData {
            guid,
            hash: 0x1234,
            sha_hash: [1; 20],
            file_size: 777,
            group_number: guid.group_number(),
        });
        let input = dir.path().join("m.manifest");
        manifest.save_to_file(&input, ManifestFormat::Json).unwrap();

        let output = dir.path().join("out.txt");
        assert_eq!(enumerate_manifest_data(&input, &output, true).unwrap(), 1);
        let text = fs::read_to_string(output).unwrap();
        assert_eq!(
            text,
            format!(
                "ChunksV3/{:02}/0000000000001234_{guid}.chunk\t777\n",
                guid.group_number()
            )
        );
    }

    #[test]
    fn test_chunk_database_listing() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![5u8; 32];
        let guid = Guid::new(1, 2, 3, 4);
        let sha = sha1_digest(&data);
        let input = dir.path().join("pack.chunkdb");
        save_chunk_database(&input, &[(guid, serialize_chunk(guid, 0xFF, sha, &data).unwrap())])
            .unwrap();

        let output = dir.path().join("out.txt");
        enumerate_manifest_data(&input, &output, false).unwrap();
        let text = fs::read_to_string(output).unwrap();
        assert_eq!(
            text,
            format!("{guid}\t00000000000000FF\t{}\n", hex::encode_upper(sha))
        );
    }
}
