mod block_structure;
pub use block_structure::{BlockEntry, BlockStructure, SearchDirection};

mod build_streamer;
pub use build_streamer::{BuildStreamer, BuildStreamerSettings};

mod chunk_data;
pub use chunk_data::{
    CHUNK_DATA_SIZE, CHUNK_HEADER_MAGIC, CHUNK_HEADER_VERSION, ChunkHeader, load_chunk_file,
    parse_chunk, serialize_chunk, sha1_digest, verify_chunk};

mod chunk_database;
pub use chunk_database::{
    CHUNKDB_HEADER_MAGIC, ChunkDatabaseHeader, ChunkDatabaseReader, ChunkLocation,
    save_chunk_database, write_chunk_database};

mod chunk_writer;
pub use chunk_writer::ChunkWriter;

mod cloud_enumeration;
pub use cloud_enumeration::CloudEnumeration;

mod compactifier;
pub use compactifier::{
    CompactifySettings, CompactifySummary, DEFAULT_COMPACTIFY_AGE_THRESHOLD,
    compactify_cloud_directory};

mod data_enumeration;
pub use data_enumeration::enumerate_manifest_data;

mod data_scanner;
pub use data_scanner::{DataScanner, ScanResult, ScannerCounters, find_chunk_data_matches};

mod file_lists;
pub use file_lists::{
    FileAttributes, load_attribute_list, load_ignore_list, parse_attribute_list,
    parse_ignore_list};

mod generation;
pub use generation::{
    DEFAULT_DATA_AGE_THRESHOLD, DEFAULT_SCANNER_BACKLOG, GenerationSettings, GenerationSummary,
    MAX_SCANNER_BACKLOG, MIN_SCANNER_BACKLOG, SCANNER_DATA_SIZE, SCANNER_OVERLAP,
    generate_chunks_manifest_from_directory};

mod guid;
pub use guid::Guid;

mod lib_error_handling;
pub use lib_error_handling::BuildPatchError;

mod lib_structs;
pub use lib_structs::{
    ChunkInfoData, ChunkMatch, ChunkPartData, FileManifestData, FileSpan, ShaHash};

mod manifest;
pub use manifest::{MANIFEST_HEADER_MAGIC, Manifest, ManifestFormat, ManifestVersion};

mod manifest_builder;
pub use manifest_builder::{ManifestBuilder, ManifestDetails};

mod package_chunks;
pub use package_chunks::package_chunks;

mod rolling_hash;
pub use rolling_hash::RollingHash;

mod utils;
pub use utils::{
    get_chunk_new_filename, get_chunk_old_filename, get_data_subdir, get_file_new_filename,
    get_file_old_filename, get_guid_from_filename, human_readable_size};

mod verify;
pub use verify::verify_chunk_data;
