//! Chunk file reading and writing.
//!
//! A chunk file is a small little-endian header followed by the chunk
//! payload. The payload is zlib compressed when that makes it smaller.
//! Headers are versioned: version 1 only carries the rolling hash,
//! version 2 adds the SHA-1 and a hash type byte, and version 3 records
//! the uncompressed payload size. Readers accept every version, writers
//! always produce version 3.

use std::{
    fs,
    io::{Cursor, Read, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use sha1::{Digest, Sha1};

use crate::{
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::ShaHash,
    rolling_hash::RollingHash,
};

/// Size of the data every chunk describes.
pub const CHUNK_DATA_SIZE: usize = 1024 * 1024;

pub const CHUNK_HEADER_MAGIC: u32 = 0xB1FE_3AA2;
pub const CHUNK_HEADER_VERSION: u32 = 3;

pub const STORED_COMPRESSED: u8 = 0x01;
pub const STORED_ENCRYPTED: u8 = 0x02;

pub const HASH_ROLLING_POLY64: u8 = 0x01;
pub const HASH_SHA1: u8 = 0x02;

const HEADER_SIZE_V1: u32 = 41;
const HEADER_SIZE_V2: u32 = 62;
const HEADER_SIZE_V3: u32 = 66;

fn header_size_for_version(version: u32) -> u32 {
    match version {
        1 => HEADER_SIZE_V1,
        2 => HEADER_SIZE_V2,
        _ => HEADER_SIZE_V3,
    }
}

/// Computes the SHA-1 digest of a slice.
pub fn sha1_digest(data: &[u8]) -> ShaHash {
    Sha1::digest(data).into()
}

/// The fixed header at the start of every chunk file.
///
/// # Fields
///
/// * `version`: Header version the chunk was written with.
/// * `header_size`: Size of the header in bytes; the payload starts here.
/// * `data_size_compressed`: Size of the payload as stored in the file.
/// * `data_size_uncompressed`: Size of the payload once decompressed.
/// * `guid`: Identity of the chunk.
/// * `rolling_hash`: Rolling hash of the uncompressed payload.
/// * `stored_as`: Storage flags, see `STORED_COMPRESSED`.
/// * `sha_hash`: SHA-1 of the uncompressed payload, version 2 and newer.
/// * `hash_type`: Which of the two hashes are valid.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkHeader {
    pub version: u32,
    pub header_size: u32,
    pub data_size_compressed: u32,
    pub data_size_uncompressed: u32,
    pub guid: Guid,
    pub rolling_hash: u64,
    pub stored_as: u8,
    pub sha_hash: ShaHash,
    pub hash_type: u8,
}

impl ChunkHeader {
    pub fn new(guid: Guid, rolling_hash: u64, sha_hash: ShaHash) -> Self {
        Self {
            version: CHUNK_HEADER_VERSION,
            header_size: HEADER_SIZE_V3,
            data_size_compressed: 0,
            data_size_uncompressed: 0,
            guid,
            rolling_hash,
            stored_as: 0,
            sha_hash,
            hash_type: HASH_ROLLING_POLY64 | HASH_SHA1,
        }
    }

    pub fn is_compressed(&self) -> bool {
        self.stored_as & STORED_COMPRESSED != 0
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), BuildPatchError> {
        writer.write_u32::<LittleEndian>(CHUNK_HEADER_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.header_size)?;
        writer.write_u32::<LittleEndian>(self.data_size_compressed)?;
        writer.write_all(&self.guid.to_le_bytes())?;
        writer.write_u64::<LittleEndian>(self.rolling_hash)?;
        writer.write_u8(self.stored_as)?;
        if self.version >= 2 {
            writer.write_all(&self.sha_hash)?;
            writer.write_u8(self.hash_type)?;
        }
        if self.version >= 3 {
            writer.write_u32::<LittleEndian>(self.data_size_uncompressed)?;
        }
        Ok(())
    }

    /// Reads a header and leaves the reader positioned at the payload.
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, BuildPatchError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != CHUNK_HEADER_MAGIC {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Bad chunk magic {magic:#010X}"
            )));
        }

        let version = reader.read_u32::<LittleEndian>()?;
        if version == 0 {
            return Err(BuildPatchError::InvalidHeaderError(
                "Chunk header version 0 is not valid".to_string(),
            ));
        }
        let header_size = reader.read_u32::<LittleEndian>()?;
        let min_size = header_size_for_version(version.min(CHUNK_HEADER_VERSION));
        if header_size < min_size {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Header size {header_size} too small for version {version}"
            )));
        }

        let data_size_compressed = reader.read_u32::<LittleEndian>()?;
        let guid = Guid::new(
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
            reader.read_u32::<LittleEndian>()?,
        );
        let rolling_hash = reader.read_u64::<LittleEndian>()?;
        let stored_as = reader.read_u8()?;

        let mut sha_hash = [0u8; 20];
        let mut hash_type = HASH_ROLLING_POLY64;
        if version >= 2 {
            reader.read_exact(&mut sha_hash)?;
            hash_type = reader.read_u8()?;
        }

        let data_size_uncompressed = if version >= 3 {
            reader.read_u32::<LittleEndian>()?
        } else if stored_as & STORED_COMPRESSED != 0 {
            CHUNK_DATA_SIZE as u32
        } else {
            data_size_compressed
        };

        //Newer writers may append fields this reader does not know.
        let unread = u64::from(header_size - min_size);
        if unread > 0 {
            std::io::copy(&mut reader.by_ref().take(unread), &mut std::io::sink())?;
        }

        Ok(Self {
            version,
            header_size,
            data_size_compressed,
            data_size_uncompressed,
            guid,
            rolling_hash,
            stored_as,
            sha_hash,
            hash_type,
        })
    }
}

/// Serializes chunk data into the bytes of a chunk file.
///
/// The payload is stored compressed only if zlib actually shrinks it.
///
/// # Arguments
///
/// * `guid`: Identity of the new chunk.
/// * `rolling_hash`: Rolling hash of `data`.
/// * `sha_hash`: SHA-1 of `data`.
/// * `data`: Uncompressed chunk payload.
///
/// # Returns
///
/// A `Result` containing the complete chunk file contents.
pub fn serialize_chunk(
    guid: Guid,
    rolling_hash: u64,
    sha_hash: ShaHash,
    data: &[u8],
) -> Result<Vec<u8>, BuildPatchError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    let compressed = encoder.finish()?;

    let mut header = ChunkHeader::new(guid, rolling_hash, sha_hash);
    header.data_size_uncompressed = data.len() as u32;

    let payload: &[u8] = if compressed.len() < data.len() {
        header.stored_as |= STORED_COMPRESSED;
        &compressed
    } else {
        data
    };
    header.data_size_compressed = payload.len() as u32;

    let mut out = Vec::with_capacity(header.header_size as usize + payload.len());
    header.write_to(&mut out)?;
    out.extend_from_slice(payload);
    Ok(out)
}

/// Parses chunk file bytes into the header and uncompressed payload.
///
/// Only structural problems are reported here. Use `verify_chunk` to
/// check the payload against the header hashes.
pub fn parse_chunk(bytes: &[u8]) -> Result<(ChunkHeader, Vec<u8>), BuildPatchError> {
    let mut cursor = Cursor::new(bytes);
    let header = ChunkHeader::read_from(&mut cursor)?;

    if header.stored_as & STORED_ENCRYPTED != 0 {
        return Err(BuildPatchError::UnsupportedStorage(format!(
            "Chunk {} is encrypted",
            header.guid
        )));
    }

    let start = header.header_size as usize;
    let end = start + header.data_size_compressed as usize;
    if end > bytes.len() {
        return Err(BuildPatchError::InvalidHeaderError(format!(
            "Chunk {} declares {} payload bytes but only {} are present",
            header.guid,
            header.data_size_compressed,
            bytes.len().saturating_sub(start)
        )));
    }
    let payload = &bytes[start..end];

    if header.data_size_uncompressed as usize > CHUNK_DATA_SIZE {
        return Err(BuildPatchError::InvalidHeaderError(format!(
            "Chunk {} declares {} data bytes, more than the chunk size {}",
            header.guid, header.data_size_uncompressed, CHUNK_DATA_SIZE
        )));
    }

    let data = if header.is_compressed() {
        //One byte past the declared size is enough to detect an oversized stream.
        let limit = u64::from(header.data_size_uncompressed) + 1;
        let mut decoded = Vec::with_capacity(header.data_size_uncompressed as usize);
        ZlibDecoder::new(payload)
            .take(limit)
            .read_to_end(&mut decoded)?;
        decoded
    } else {
        payload.to_vec()
    };

    if data.len() != header.data_size_uncompressed as usize {
        return Err(BuildPatchError::InvalidHeaderError(format!(
            "Chunk {} decompressed to {} bytes, expected {}",
            header.guid,
            data.len(),
            header.data_size_uncompressed
        )));
    }

    Ok((header, data))
}

/// Checks a chunk payload against the hashes recorded in its header.
pub fn verify_chunk(header: &ChunkHeader, data: &[u8]) -> Result<(), BuildPatchError> {
    if header.hash_type & HASH_SHA1 != 0 {
        if sha1_digest(data) != header.sha_hash {
            return Err(BuildPatchError::HashMismatchError(format!(
                "SHA-1 mismatch for chunk {}",
                header.guid
            )));
        }
    } else if header.hash_type & HASH_ROLLING_POLY64 != 0 {
        if RollingHash::get_hash_for_data_set(data) != header.rolling_hash {
            return Err(BuildPatchError::HashMismatchError(format!(
                "Rolling hash mismatch for chunk {}",
                header.guid
            )));
        }
    } else {
        return Err(BuildPatchError::InvalidHeaderError(format!(
            "Chunk {} has no usable hash type",
            header.guid
        )));
    }
    Ok(())
}

/// Loads a chunk file from disk, returning its header and verified data.
pub fn load_chunk_file(path: &Path) -> Result<(ChunkHeader, Vec<u8>), BuildPatchError> {
    let bytes = fs::read(path)?;
    let (header, data) = parse_chunk(&bytes)?;
    verify_chunk(&header, &data)?;
    Ok((header, data))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk_payload() -> Vec<u8> {
        (0..CHUNK_DATA_SIZE).map(|i| (i % 251) as u8).collect()
    }

    #[test]
    fn test_header_sizes_match_layout() {
        for version in 1..=3 {
            let mut header = ChunkHeader::new(Guid::new(1, 2, 3, 4), 7, [9u8; 20]);
            header.version = version;
            header.header_size = header_size_for_version(version);
            let mut out = Vec::new();
            header.write_to(&mut out).unwrap();
            assert_eq!(out.len() as u32, header.header_size);
        }
    }

    #[test]
    fn test_serialized_chunk_parses_and_verifies() {
        let data = chunk_payload();
        let guid = Guid::new_random();
        let hash = RollingHash::get_hash_for_data_set(&data);
        let sha = sha1_digest(&data);

        let bytes = serialize_chunk(guid, hash, sha, &data).unwrap();
        assert!(bytes.len() < data.len(), "repetitive data should compress");

        let (header, parsed) = parse_chunk(&bytes).unwrap();
        assert!(header.is_compressed());
        assert_eq!(header.guid, guid);
        assert_eq!(header.rolling_hash, hash);
        assert_eq!(parsed, data);
        verify_chunk(&header, &parsed).unwrap();
    }

    #[test]
    fn test_incompressible_chunk_stored_raw() {
        let mut seed: u64 = 0x9E37_79B9_7F4A_7C15;
        let data: Vec<u8> = (0..4096)
            .map(|_| {
                seed ^= seed << 13;
                seed ^= seed >> 7;
                seed ^= seed << 17;
                seed as u8
            })
            .collect();
        let bytes = serialize_chunk(Guid::new_random(), 0, sha1_digest(&data), &data).unwrap();
        let (header, parsed) = parse_chunk(&bytes).unwrap();
        assert!(!header.is_compressed());
        assert_eq!(parsed, data);
    }

    #[test]
    fn test_corrupt_sha_detected() {
        let data = chunk_payload();
        let bytes = serialize_chunk(Guid::new_random(), 0, [1u8; 20], &data).unwrap();
        let (header, parsed) = parse_chunk(&bytes).unwrap();
        assert!(matches!(
            verify_chunk(&header, &parsed),
            Err(BuildPatchError::HashMismatchError(_))
        ));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = serialize_chunk(Guid::new_random(), 0, [0u8; 20], &[1, 2, 3]).unwrap();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            parse_chunk(&bytes),
            Err(BuildPatchError::InvalidHeaderError(_))
        ));
    }

    #[test]
    fn test_truncated_payload_rejected() {
        let data = chunk_payload();
        let bytes = serialize_chunk(Guid::new_random(), 0, sha1_digest(&data), &data).unwrap();
        assert!(parse_chunk(&bytes[..bytes.len() - 10]).is_err());
    }

    #[test]
    fn test_oversized_declared_data_rejected() {
        let mut header = ChunkHeader::new(Guid::new(2, 2, 2, 2), 0, [0u8; 20]);
        header.stored_as |= STORED_COMPRESSED;
        header.data_size_compressed = 4;
        header.data_size_uncompressed = u32::MAX;

        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&[0x78, 0x9C, 0x03, 0x00]);

        assert!(matches!(
            parse_chunk(&bytes),
            Err(BuildPatchError::InvalidHeaderError(_))
        ));
    }

    #[test]
    fn test_stream_longer_than_declared_rejected() {
        let data = vec![0u8; 8192];
        let mut bytes = serialize_chunk(Guid::new_random(), 0, sha1_digest(&data), &data).unwrap();
        //Claim half the real size so the decoder produces too much.
        let size_offset = header_size_for_version(3) as usize - 4;
        bytes[size_offset..size_offset + 4].copy_from_slice(&4096u32.to_le_bytes());

        assert!(matches!(
            parse_chunk(&bytes),
            Err(BuildPatchError::InvalidHeaderError(_))
        ));
    }

    #[test]
    fn test_version_one_header_reads_rolling_hash() {
        let data = vec![5u8; 128];
        let mut header = ChunkHeader::new(Guid::new(1, 1, 1, 1), RollingHash::get_hash_for_data_set(&data), [0u8; 20]);
        header.version = 1;
        header.header_size = header_size_for_version(1);
        header.data_size_compressed = data.len() as u32;
        header.hash_type = HASH_ROLLING_POLY64;

        let mut bytes = Vec::new();
        header.write_to(&mut bytes).unwrap();
        bytes.extend_from_slice(&data);

        let (parsed_header, parsed) = parse_chunk(&bytes).unwrap();
        assert_eq!(parsed_header.data_size_uncompressed, 128);
        verify_chunk(&parsed_header, &parsed).unwrap();
    }
}
