//! Declares the core data structures shared across the library.
//!
//! These types describe a build and the manifest produced from it. Most of
//! them are plain data carriers: `FileSpan` is produced by the build
//! streamer, `ChunkMatch` by the data scanner, and the `*Data` structs are
//! the persisted parts of a manifest.

use serde::{Deserialize, Serialize};

use crate::guid::Guid;

/// A SHA-1 digest.
pub type ShaHash = [u8; 20];

/// One file of a build as laid out in the concatenated build stream.
///
/// # Fields
///
/// * `filename`: Path of the file relative to the build root, using `/`
///   separators.
/// * `size`: Number of bytes the file contributes to the stream.
/// * `start_idx`: Offset of the first byte of the file in build space,
///   zero for empty files and symlinks.
/// * `is_unix_executable`: Whether any execute bit is set on the file.
/// * `symlink_target`: Target of the link if the entry is a symlink,
///   otherwise empty.
/// * `sha_hash`: SHA-1 of the whole file content.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileSpan {
    pub filename: String,
    pub size: u64,
    pub start_idx: u64,
    pub is_unix_executable: bool,
    pub symlink_target: String,
    pub sha_hash: ShaHash,
}

impl FileSpan {
    pub fn end_idx(&self) -> u64 {
        self.start_idx + self.size
    }
}

/// A chunk found in a scanner's buffer.
///
/// `data_offset` is relative to the start of the buffer the scanner was
/// given, not to build space.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkMatch {
    pub data_offset: u64,
    pub chunk_guid: Guid,
}

/// Persisted metadata for one chunk.
///
/// # Fields
///
/// * `guid`: Identity of the chunk.
/// * `hash`: Rolling hash of the chunk's full window of data.
/// * `sha_hash`: SHA-1 of the chunk data. All zero when unknown.
/// * `file_size`: Size of the chunk file on disk.
/// * `group_number`: Storage sub directory the chunk lives in.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkInfoData {
    pub guid: Guid,
    pub hash: u64,
    pub sha_hash: ShaHash,
    pub file_size: u64,
    pub group_number: u8,
}

impl ChunkInfoData {
    pub fn has_sha(&self) -> bool {
        self.sha_hash.iter().any(|&b| b != 0)
    }
}

/// A byte range taken from one chunk.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkPartData {
    pub guid: Guid,
    pub offset: u32,
    pub size: u32,
}

/// Persisted description of one file of the build.
///
/// Concatenating the listed chunk parts in order reproduces the file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileManifestData {
    pub filename: String,
    pub file_hash: ShaHash,
    pub file_chunk_parts: Vec<ChunkPartData>,
    pub install_tags: Vec<String>,
    pub is_unix_executable: bool,
    pub is_read_only: bool,
    pub is_compressed: bool,
    pub symlink_target: String,
}

impl FileManifestData {
    pub fn get_file_size(&self) -> u64 {
        self.file_chunk_parts
            .iter()
            .map(|part| u64::from(part.size))
            .sum()
    }
}
