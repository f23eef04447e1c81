//! Chunk database (`.chunkdb`) files.
//!
//! A chunk database packs many chunk files into one container so that a
//! set of chunks can be shipped or archived as a single file. The header
//! holds a table of contents; the chunk files follow it byte for byte at
//! the absolute offsets the table declares.

use std::{
    fs::File,
    io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::{guid::Guid, lib_error_handling::BuildPatchError};

pub const CHUNKDB_HEADER_MAGIC: u32 = 0xB1FE_3AA3;
pub const CHUNKDB_HEADER_VERSION: u32 = 1;

const FIXED_HEADER_SIZE: u32 = 24;
const TABLE_ENTRY_SIZE: u32 = 28;

/// Location of one chunk file inside a chunk database.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ChunkLocation {
    pub guid: Guid,
    pub byte_start: u64,
    pub byte_size: u32,
}

/// Header and table of contents of a chunk database.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChunkDatabaseHeader {
    pub version: u32,
    pub header_size: u32,
    pub data_size: u64,
    pub contents: Vec<ChunkLocation>,
}

impl ChunkDatabaseHeader {
    pub fn header_size_for(num_chunks: usize) -> u64 {
        u64::from(FIXED_HEADER_SIZE) + u64::from(TABLE_ENTRY_SIZE) * num_chunks as u64
    }

    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<(), BuildPatchError> {
        writer.write_u32::<LittleEndian>(CHUNKDB_HEADER_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.version)?;
        writer.write_u32::<LittleEndian>(self.header_size)?;
        writer.write_u64::<LittleEndian>(self.data_size)?;
        writer.write_u32::<LittleEndian>(self.contents.len() as u32)?;
        for location in &self.contents {
            writer.write_all(&location.guid.to_le_bytes())?;
            writer.write_u64::<LittleEndian>(location.byte_start)?;
            writer.write_u32::<LittleEndian>(location.byte_size)?;
        }
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self, BuildPatchError> {
        Self::read_bounded(reader, u64::MAX)
    }

    /// Reads a header from a source that holds at most `max_len` bytes.
    ///
    /// The declared table size is checked against `max_len` before any
    /// entries are allocated.
    pub fn read_bounded<R: Read>(reader: &mut R, max_len: u64) -> Result<Self, BuildPatchError> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != CHUNKDB_HEADER_MAGIC {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Bad chunk database magic {magic:#010X}"
            )));
        }
        let version = reader.read_u32::<LittleEndian>()?;
        let header_size = reader.read_u32::<LittleEndian>()?;
        let data_size = reader.read_u64::<LittleEndian>()?;
        let num_chunks = reader.read_u32::<LittleEndian>()?;

        if u64::from(header_size) < Self::header_size_for(num_chunks as usize) {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Chunk database header size {header_size} cannot hold {num_chunks} entries"
            )));
        }
        if Self::header_size_for(num_chunks as usize) > max_len {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Chunk database declares {num_chunks} entries but holds only {max_len} bytes"
            )));
        }

        let mut contents = Vec::with_capacity(num_chunks as usize);
        for _ in 0..num_chunks {
            let guid = Guid::new(
                reader.read_u32::<LittleEndian>()?,
                reader.read_u32::<LittleEndian>()?,
                reader.read_u32::<LittleEndian>()?,
                reader.read_u32::<LittleEndian>()?,
            );
            let byte_start = reader.read_u64::<LittleEndian>()?;
            let byte_size = reader.read_u32::<LittleEndian>()?;
            contents.push(ChunkLocation {
                guid,
                byte_start,
                byte_size,
            });
        }

        Ok(Self {
            version,
            header_size,
            data_size,
            contents,
        })
    }
}

/// Writes a chunk database containing the given chunk files.
///
/// # Arguments
///
/// * `writer`: Destination for the database bytes.
/// * `chunks`: Pairs of chunk GUID and complete chunk file contents, in
///   the order they should be stored.
///
/// # Returns
///
/// A `Result` containing the header that was written.
pub fn write_chunk_database<W: Write>(
    writer: &mut W,
    chunks: &[(Guid, Vec<u8>)],
) -> Result<ChunkDatabaseHeader, BuildPatchError> {
    let header_size = ChunkDatabaseHeader::header_size_for(chunks.len());
    let header_size = u32::try_from(header_size).map_err(|_| {
        BuildPatchError::InternalLibError("Too many chunks for one chunk database".to_string())
    })?;

    let mut byte_start = u64::from(header_size);
    let mut contents = Vec::with_capacity(chunks.len());
    for (guid, bytes) in chunks {
        let byte_size = u32::try_from(bytes.len()).map_err(|_| {
            BuildPatchError::InternalLibError(format!("Chunk {guid} is too large to pack"))
        })?;
        contents.push(ChunkLocation {
            guid: *guid,
            byte_start,
            byte_size,
        });
        byte_start += u64::from(byte_size);
    }

    let header = ChunkDatabaseHeader {
        version: CHUNKDB_HEADER_VERSION,
        header_size,
        data_size: byte_start - u64::from(header_size),
        contents,
    };

    header.write_to(writer)?;
    for (_, bytes) in chunks {
        writer.write_all(bytes)?;
    }
    Ok(header)
}

/// Random access reader over a chunk database file.
pub struct ChunkDatabaseReader {
    reader: BufReader<File>,
    header: ChunkDatabaseHeader,
    file_len: u64,
}

impl ChunkDatabaseReader {
    pub fn open(path: &Path) -> Result<Self, BuildPatchError> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let header = ChunkDatabaseHeader::read_bounded(&mut reader, file_len)?;
        Ok(Self {
            reader,
            header,
            file_len,
        })
    }

    pub fn header(&self) -> &ChunkDatabaseHeader {
        &self.header
    }

    /// Reads the raw chunk file bytes stored at `location`.
    pub fn read_chunk_bytes(&mut self, location: &ChunkLocation) -> Result<Vec<u8>, BuildPatchError> {
        let end = location.byte_start.saturating_add(u64::from(location.byte_size));
        if end > self.file_len {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Chunk {} lies past the end of the database",
                location.guid
            )));
        }
        self.reader.seek(SeekFrom::Start(location.byte_start))?;
        let mut bytes = vec![0u8; location.byte_size as usize];
        self.reader.read_exact(&mut bytes)?;
        Ok(bytes)
    }
}

/// Creates a chunk database file at `path`.
pub fn save_chunk_database(
    path: &Path,
    chunks: &[(Guid, Vec<u8>)],
) -> Result<ChunkDatabaseHeader, BuildPatchError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    let header = write_chunk_database(&mut writer, chunks)?;
    writer.flush()?;
    Ok(header)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_data::{parse_chunk, serialize_chunk, sha1_digest};

    #[test]
    fn test_database_contents_readable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("pack.chunkdb");

        let chunks: Vec<(Guid, Vec<u8>)> = (0..3u8)
            .map(|i| {
                let data = vec![i; 1000 + i as usize];
                let guid = Guid::new_random();
                (guid, serialize_chunk(guid, 0, sha1_digest(&data), &data).unwrap())
            })
            .collect();

        let written = save_chunk_database(&path, &chunks).unwrap();
        assert_eq!(written.header_size as u64, ChunkDatabaseHeader::header_size_for(3));

        let mut reader = ChunkDatabaseReader::open(&path).unwrap();
        assert_eq!(reader.header(), &written);
        let contents = reader.header().contents.clone();
        assert_eq!(contents[0].byte_start, written.header_size as u64);

        for (location, (guid, bytes)) in contents.iter().zip(&chunks) {
            assert_eq!(location.guid, *guid);
            let read = reader.read_chunk_bytes(location).unwrap();
            assert_eq!(&read, bytes);
            let (header, _) = parse_chunk(&read).unwrap();
            assert_eq!(header.guid, *guid);
        }
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = Vec::new();
        write_chunk_database(&mut bytes, &[]).unwrap();
        bytes[3] = 0;
        assert!(ChunkDatabaseHeader::read_from(&mut bytes.as_slice()).is_err());
    }

    #[test]
    fn test_truncated_table_rejected_before_reading() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("huge.chunkdb");

        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(CHUNKDB_HEADER_MAGIC).unwrap();
        bytes.write_u32::<LittleEndian>(CHUNKDB_HEADER_VERSION).unwrap();
        bytes.write_u32::<LittleEndian>(u32::MAX).unwrap();
        bytes.write_u64::<LittleEndian>(0).unwrap();
        bytes.write_u32::<LittleEndian>(1_000_000).unwrap();
        std::fs::write(&path, &bytes).unwrap();

        assert!(matches!(
            ChunkDatabaseReader::open(&path),
            Err(BuildPatchError::InvalidHeaderError(_))
        ));
    }

    #[test]
    fn test_entry_past_end_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("short.chunkdb");
        let data = vec![7u8; 100];
        let guid = Guid::new_random();
        let chunk = serialize_chunk(guid, 0, sha1_digest(&data), &data).unwrap();
        save_chunk_database(&path, &[(guid, chunk)]).unwrap();

        let mut reader = ChunkDatabaseReader::open(&path).unwrap();
        let mut location = reader.header().contents[0];
        location.byte_size = u32::MAX;
        assert!(matches!(
            reader.read_chunk_bytes(&location),
            Err(BuildPatchError::InvalidHeaderError(_))
        ));
    }
}
