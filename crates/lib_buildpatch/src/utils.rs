//! Storage naming helpers.
//!
//! Chunk and file data live under a cloud directory, bucketed into one of
//! a hundred group sub directories. Newer stores embed the rolling hash in
//! the file name so readers can find the right file without a manifest
//! lookup, while legacy stores only use the GUID.

use std::path::{Path, PathBuf};

use bytesize::ByteSize;

use crate::{guid::Guid, manifest::ManifestVersion};

pub const CHUNK_EXTENSION: &str = "chunk";
pub const FILE_EXTENSION: &str = "file";
pub const CHUNKDB_EXTENSION: &str = "chunkdb";
pub const MANIFEST_EXTENSION: &str = "manifest";

/// Returns the top level data directory name used by a manifest version.
pub fn get_data_subdir(version: ManifestVersion, is_file_data: bool) -> &'static str {
    match (is_file_data, version) {
        (false, v) if v < ManifestVersion::DataFileRenames => "Chunks",
        (false, v) if v < ManifestVersion::ChunkCompressionSupport => "ChunksV2",
        (false, _) => "ChunksV3",
        (true, v) if v < ManifestVersion::DataFileRenames => "Files",
        (true, v) if v < ManifestVersion::ChunkCompressionSupport => "FilesV2",
        (true, _) => "FilesV3",
    }
}

fn group_dir(guid: &Guid) -> String {
    format!("{:02}", guid.group_number())
}

/// Path of a chunk file using the hash embedding naming convention.
///
/// # Arguments
///
/// * `version`: Manifest version, selects the data sub directory.
/// * `root`: Cloud directory the path is relative to. Pass an empty path
///   to get a cloud relative path.
/// * `guid`: Identity of the chunk.
/// * `hash`: Rolling hash of the chunk.
pub fn get_chunk_new_filename(
    version: ManifestVersion,
    root: &Path,
    guid: &Guid,
    hash: u64,
) -> PathBuf {
    root.join(get_data_subdir(version, false))
        .join(group_dir(guid))
        .join(format!("{hash:016X}_{guid}.{CHUNK_EXTENSION}"))
}

pub fn get_file_new_filename(
    version: ManifestVersion,
    root: &Path,
    guid: &Guid,
    hash: u64,
) -> PathBuf {
    root.join(get_data_subdir(version, true))
        .join(group_dir(guid))
        .join(format!("{hash:016X}_{guid}.{FILE_EXTENSION}"))
}

/// Path of a chunk file in a store that predates hash embedded names.
pub fn get_chunk_old_filename(root: &Path, guid: &Guid) -> PathBuf {
    root.join("Chunks")
        .join(group_dir(guid))
        .join(format!("{guid}.{CHUNK_EXTENSION}"))
}

pub fn get_file_old_filename(root: &Path, guid: &Guid) -> PathBuf {
    root.join("Files")
        .join(group_dir(guid))
        .join(format!("{guid}.{FILE_EXTENSION}"))
}

/// Extracts the GUID from a chunk or file data file name.
///
/// Accepts both `<HASH>_<GUID>.chunk` and the legacy `<GUID>.chunk`
/// forms. Returns `None` for anything else.
pub fn get_guid_from_filename(path: &Path) -> Option<Guid> {
    let stem = path.file_stem()?.to_str()?;
    let guid_text = match stem.split_once('_') {
        Some((_, guid)) => guid,
        None => stem,
    };
    guid_text.parse().ok()
}

/// Normalizes a build relative path for comparisons.
///
/// Separators become `/`, leading `./` and `/` are stripped and the result
/// is lower cased, as build paths are matched case insensitively.
pub fn normalize_build_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let trimmed = unified.trim_start_matches("./").trim_start_matches('/');
    trimmed.to_lowercase()
}

/// Converts a path to a `/` separated string relative to `root`.
pub fn relative_path_string(root: &Path, path: &Path) -> String {
    let relative = path.strip_prefix(root).unwrap_or(path);
    relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

pub fn human_readable_size(bytes: u64) -> String {
    ByteSize::b(bytes).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subdir_by_version() {
        assert_eq!(get_data_subdir(ManifestVersion::Original, false), "Chunks");
        assert_eq!(get_data_subdir(ManifestVersion::DataFileRenames, false), "ChunksV2");
        assert_eq!(get_data_subdir(ManifestVersion::StoresDataGroupNumbers, true), "FilesV2");
        assert_eq!(get_data_subdir(ManifestVersion::LATEST, false), "ChunksV3");
    }

    #[test]
    fn test_chunk_filename_layout() {
        let guid = Guid::new(0xA, 0xB, 0xC, 0xD);
        let path = get_chunk_new_filename(
            ManifestVersion::LATEST,
            Path::new("cloud"),
            &guid,
            0x1234,
        );
        let expected = Path::new("cloud")
            .join("ChunksV3")
            .join(format!("{:02}", guid.group_number()))
            .join("0000000000001234_0000000A0000000B0000000C0000000D.chunk");
        assert_eq!(path, expected);
        assert_eq!(get_guid_from_filename(&path), Some(guid));
    }

    #[test]
    fn test_guid_from_legacy_filename() {
        let guid = Guid::new(1, 2, 3, 4);
        let path = get_chunk_old_filename(Path::new("cloud"), &guid);
        assert!(path.starts_with(Path::new("cloud").join("Chunks")));
        assert_eq!(get_guid_from_filename(&path), Some(guid));
        assert_eq!(get_guid_from_filename(Path::new("readme.txt")), None);
    }

    #[test]
    fn test_normalize_build_path() {
        assert_eq!(normalize_build_path(".\\Engine\\Binaries\\Game.EXE"), "engine/binaries/game.exe");
        assert_eq!(normalize_build_path("/Content/Pak.pak "), "content/pak.pak");
    }
}
