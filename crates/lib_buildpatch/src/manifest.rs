//! Build manifests.
//!
//! A manifest describes a build: its identity, launch and prerequisite
//! details, every file it contains and, for each file, the ordered list of
//! chunk parts that reconstruct it. Manifests are saved either as JSON or
//! in a compact binary form. The binary form is a small header followed by
//! a bincode encoding of `Manifest`, optionally zlib compressed. Loading
//! detects the form from the first four bytes.
//!
//! The JSON form stores integers and hashes as "blob" strings: every byte
//! of the little-endian value is written as three decimal digits. The
//! format predates JSON numbers large enough to carry 64 bit values, and
//! existing readers depend on it.

use std::{
    collections::{BTreeMap, HashSet},
    fs,
    io::{Cursor, Read, Write},
    path::Path,
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use flate2::{Compression, read::ZlibDecoder, write::ZlibEncoder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{
    chunk_data::sha1_digest,
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::{ChunkInfoData, ChunkPartData, FileManifestData, ShaHash},
    utils::{
        get_chunk_new_filename, get_chunk_old_filename, get_file_new_filename,
        get_file_old_filename,
    },
};

pub const MANIFEST_HEADER_MAGIC: u32 = 0x44BE_C00C;
const MANIFEST_HEADER_SIZE: u32 = 37;
const MANIFEST_STORED_COMPRESSED: u8 = 0x01;
//Deflate cannot expand a stream by more than this factor.
const MAX_DEFLATE_RATIO: usize = 1032;

/// Manifest feature levels.
///
/// Each version gates a feature of the format. Stores written before a
/// feature existed lack its data, so readers check the version before
/// relying on a field.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ManifestVersion {
    Original,
    CustomFields,
    StartStoringVersion,
    DataFileRenames,
    StoresIfChunkOrFileData,
    StoresDataGroupNumbers,
    ChunkCompressionSupport,
    StoresPrerequisitesInfo,
    StoresChunkFileSizes,
    StoredAsCompressedUClass,
    Unused0,
    Unused1,
    StoresChunkDataShaHashes,
    StoresPrerequisiteIds,
}

impl ManifestVersion {
    pub const LATEST: ManifestVersion = ManifestVersion::StoresPrerequisiteIds;

    const ALL: [ManifestVersion; 14] = [
        ManifestVersion::Original,
        ManifestVersion::CustomFields,
        ManifestVersion::StartStoringVersion,
        ManifestVersion::DataFileRenames,
        ManifestVersion::StoresIfChunkOrFileData,
        ManifestVersion::StoresDataGroupNumbers,
        ManifestVersion::ChunkCompressionSupport,
        ManifestVersion::StoresPrerequisitesInfo,
        ManifestVersion::StoresChunkFileSizes,
        ManifestVersion::StoredAsCompressedUClass,
        ManifestVersion::Unused0,
        ManifestVersion::Unused1,
        ManifestVersion::StoresChunkDataShaHashes,
        ManifestVersion::StoresPrerequisiteIds,
    ];

    pub fn as_i32(self) -> i32 {
        self as i32
    }

    /// Maps a stored version number back to a version.
    ///
    /// Numbers newer than this library understands are rejected.
    pub fn from_i32(value: i32) -> Result<Self, BuildPatchError> {
        usize::try_from(value)
            .ok()
            .and_then(|idx| Self::ALL.get(idx).copied())
            .ok_or_else(|| {
                BuildPatchError::ManifestDecodeError(format!(
                    "Unsupported manifest version {value}"
                ))
            })
    }
}

/// On disk form used when saving a manifest.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ManifestFormat {
    #[default]
    Json,
    Binary,
}

/// The root persisted description of a build.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub manifest_version: ManifestVersion,
    pub is_file_data: bool,
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    pub file_manifest_list: Vec<FileManifestData>,
    pub chunk_list: Vec<ChunkInfoData>,
    pub custom_fields: BTreeMap<String, String>,
}

impl Default for Manifest {
    fn default() -> Self {
        Self {
            manifest_version: ManifestVersion::LATEST,
            is_file_data: false,
            app_id: 0,
            app_name: String::new(),
            build_version: String::new(),
            launch_exe: String::new(),
            launch_command: String::new(),
            prereq_ids: Vec::new(),
            prereq_name: String::new(),
            prereq_path: String::new(),
            prereq_args: String::new(),
            file_manifest_list: Vec::new(),
            chunk_list: Vec::new(),
            custom_fields: BTreeMap::new(),
        }
    }
}

impl Manifest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every data GUID referenced by the file list, in first use
    /// order and without duplicates.
    pub fn get_data_list(&self) -> Vec<Guid> {
        let mut seen = HashSet::new();
        self.file_manifest_list
            .iter()
            .flat_map(|file| file.file_chunk_parts.iter())
            .filter(|part| seen.insert(part.guid))
            .map(|part| part.guid)
            .collect()
    }

    pub fn get_chunk_info(&self, guid: &Guid) -> Option<&ChunkInfoData> {
        self.chunk_list.iter().find(|info| info.guid == *guid)
    }

    pub fn get_file_manifest(&self, filename: &str) -> Option<&FileManifestData> {
        self.file_manifest_list
            .iter()
            .find(|file| file.filename == filename)
    }

    /// Total size of the build the manifest describes.
    pub fn get_build_size(&self) -> u64 {
        self.file_manifest_list
            .iter()
            .map(FileManifestData::get_file_size)
            .sum()
    }

    /// Path of the data file for `guid` under `cloud_dir`.
    ///
    /// The naming convention depends on the manifest version. Returns
    /// `None` when the chunk is not listed in this manifest.
    pub fn get_data_filename(&self, cloud_dir: &Path, guid: &Guid) -> Option<std::path::PathBuf> {
        let info = self.get_chunk_info(guid)?;
        let path = match (
            self.is_file_data,
            self.manifest_version < ManifestVersion::DataFileRenames,
        ) {
            (false, true) => get_chunk_old_filename(cloud_dir, guid),
            (true, true) => get_file_old_filename(cloud_dir, guid),
            (false, false) => {
                get_chunk_new_filename(self.manifest_version, cloud_dir, guid, info.hash)
            }
            (true, false) => {
                get_file_new_filename(self.manifest_version, cloud_dir, guid, info.hash)
            }
        };
        Some(path)
    }

    pub fn serialize_to_json(&self) -> Result<String, BuildPatchError> {
        let json = JsonManifest::from(self);
        Ok(serde_json::to_string_pretty(&json)?)
    }

    pub fn deserialize_from_json(text: &str) -> Result<Self, BuildPatchError> {
        let json: JsonManifest = serde_json::from_str(text)?;
        json.into_manifest()
    }

    /// Serializes the manifest into the binary form.
    ///
    /// The body is compressed when zlib makes it smaller.
    pub fn serialize_to_binary(&self) -> Result<Vec<u8>, BuildPatchError> {
        let config = bincode::config::standard();
        let body = bincode::serde::encode_to_vec(self, config)
            .map_err(|e| BuildPatchError::ManifestEncodeError(e.to_string()))?;

        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        let compressed = encoder.finish()?;

        let (stored_as, payload) = if compressed.len() < body.len() {
            (MANIFEST_STORED_COMPRESSED, compressed)
        } else {
            (0, body.clone())
        };

        let mut out = Vec::with_capacity(MANIFEST_HEADER_SIZE as usize + payload.len());
        out.write_u32::<LittleEndian>(MANIFEST_HEADER_MAGIC)?;
        out.write_u32::<LittleEndian>(MANIFEST_HEADER_SIZE)?;
        out.write_u32::<LittleEndian>(body.len() as u32)?;
        out.write_u32::<LittleEndian>(payload.len() as u32)?;
        out.write_all(&sha1_digest(&body))?;
        out.write_u8(stored_as)?;
        out.extend_from_slice(&payload);
        Ok(out)
    }

    pub fn deserialize_from_binary(bytes: &[u8]) -> Result<Self, BuildPatchError> {
        let mut cursor = Cursor::new(bytes);
        let magic = cursor.read_u32::<LittleEndian>()?;
        if magic != MANIFEST_HEADER_MAGIC {
            return Err(BuildPatchError::InvalidHeaderError(format!(
                "Bad manifest magic {magic:#010X}"
            )));
        }
        let header_size = cursor.read_u32::<LittleEndian>()?;
        let size_uncompressed = cursor.read_u32::<LittleEndian>()? as usize;
        let size_compressed = cursor.read_u32::<LittleEndian>()? as usize;
        let mut sha_hash: ShaHash = [0u8; 20];
        cursor.read_exact(&mut sha_hash)?;
        let stored_as = cursor.read_u8()?;

        let start = header_size as usize;
        let end = start + size_compressed;
        if header_size < MANIFEST_HEADER_SIZE || end > bytes.len() {
            return Err(BuildPatchError::InvalidHeaderError(
                "Manifest header sizes do not match the file".to_string(),
            ));
        }
        let payload = &bytes[start..end];

        let body = if stored_as & MANIFEST_STORED_COMPRESSED != 0 {
            if size_uncompressed > size_compressed.saturating_mul(MAX_DEFLATE_RATIO) {
                return Err(BuildPatchError::InvalidHeaderError(format!(
                    "Manifest claims {size_uncompressed} bytes from a {size_compressed} byte payload"
                )));
            }
            let mut decoded = Vec::with_capacity(size_uncompressed);
            ZlibDecoder::new(payload)
                .take(size_uncompressed as u64 + 1)
                .read_to_end(&mut decoded)?;
            decoded
        } else {
            payload.to_vec()
        };

        if body.len() != size_uncompressed || sha1_digest(&body) != sha_hash {
            return Err(BuildPatchError::HashMismatchError(
                "Manifest body does not match its header".to_string(),
            ));
        }

        let config = bincode::config::standard();
        let (manifest, _): (Manifest, usize) = bincode::serde::decode_from_slice(&body, config)
            .map_err(|e| BuildPatchError::ManifestDecodeError(e.to_string()))?;
        Ok(manifest)
    }

    /// Parses manifest bytes in either form.
    pub fn deserialize_from_data(bytes: &[u8]) -> Result<Self, BuildPatchError> {
        if bytes.len() >= 4 && bytes[..4] == MANIFEST_HEADER_MAGIC.to_le_bytes() {
            Self::deserialize_from_binary(bytes)
        } else {
            let text = std::str::from_utf8(bytes)
                .map_err(|e| BuildPatchError::ManifestDecodeError(e.to_string()))?;
            Self::deserialize_from_json(text)
        }
    }

    pub fn save_to_file(&self, path: &Path, format: ManifestFormat) -> Result<(), BuildPatchError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        match format {
            ManifestFormat::Json => fs::write(path, self.serialize_to_json()?)?,
            ManifestFormat::Binary => fs::write(path, self.serialize_to_binary()?)?,
        }
        debug!("Saved manifest {}", path.display());
        Ok(())
    }

    pub fn load_from_file(path: &Path) -> Result<Self, BuildPatchError> {
        let bytes = fs::read(path)?;
        Self::deserialize_from_data(&bytes)
    }
}

fn to_blob(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:03}")).collect()
}

fn from_blob(text: &str) -> Result<Vec<u8>, BuildPatchError> {
    if text.len() % 3 != 0 || !text.bytes().all(|b| b.is_ascii_digit()) {
        return Err(BuildPatchError::ManifestDecodeError(format!(
            "Malformed blob string \"{text}\""
        )));
    }
    (0..text.len())
        .step_by(3)
        .map(|i| {
            text[i..i + 3].parse::<u8>().map_err(|_| {
                BuildPatchError::ManifestDecodeError(format!("Malformed blob string \"{text}\""))
            })
        })
        .collect()
}

fn blob_to_array<const N: usize>(text: &str) -> Result<[u8; N], BuildPatchError> {
    let bytes = from_blob(text)?;
    let mut out = [0u8; N];
    if bytes.len() > N {
        return Err(BuildPatchError::ManifestDecodeError(format!(
            "Blob \"{text}\" is longer than {N} bytes"
        )));
    }
    out[..bytes.len()].copy_from_slice(&bytes);
    Ok(out)
}

fn blob_to_u64(text: &str) -> Result<u64, BuildPatchError> {
    Ok(u64::from_le_bytes(blob_to_array::<8>(text)?))
}

fn blob_to_u32(text: &str) -> Result<u32, BuildPatchError> {
    Ok(u32::from_le_bytes(blob_to_array::<4>(text)?))
}

fn hex_to_sha(text: &str) -> Result<ShaHash, BuildPatchError> {
    let bytes = hex::decode(text)
        .map_err(|e| BuildPatchError::ManifestDecodeError(format!("Bad SHA text: {e}")))?;
    bytes.try_into().map_err(|_| {
        BuildPatchError::ManifestDecodeError(format!("SHA \"{text}\" is not 20 bytes"))
    })
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[derive(Serialize, Deserialize)]
struct JsonChunkPart {
    #[serde(rename = "Guid")]
    guid: String,
    #[serde(rename = "Offset")]
    offset: String,
    #[serde(rename = "Size")]
    size: String,
}

#[derive(Serialize, Deserialize)]
struct JsonFileManifest {
    #[serde(rename = "Filename")]
    filename: String,
    #[serde(rename = "FileHash")]
    file_hash: String,
    #[serde(rename = "FileChunkParts", default)]
    file_chunk_parts: Vec<JsonChunkPart>,
    #[serde(rename = "InstallTags", default, skip_serializing_if = "Vec::is_empty")]
    install_tags: Vec<String>,
    #[serde(rename = "bIsUnixExecutable", default, skip_serializing_if = "is_false")]
    is_unix_executable: bool,
    #[serde(rename = "SymlinkTarget", default, skip_serializing_if = "String::is_empty")]
    symlink_target: String,
    #[serde(rename = "bIsReadOnly", default, skip_serializing_if = "is_false")]
    is_read_only: bool,
    #[serde(rename = "bIsCompressed", default, skip_serializing_if = "is_false")]
    is_compressed: bool,
}

#[derive(Serialize, Deserialize)]
struct JsonManifest {
    #[serde(rename = "ManifestFileVersion")]
    manifest_file_version: String,
    #[serde(rename = "bIsFileData", default)]
    is_file_data: bool,
    #[serde(rename = "AppID")]
    app_id: String,
    #[serde(rename = "AppNameString", default)]
    app_name: String,
    #[serde(rename = "BuildVersionString", default)]
    build_version: String,
    #[serde(rename = "LaunchExeString", default)]
    launch_exe: String,
    #[serde(rename = "LaunchCommand", default)]
    launch_command: String,
    #[serde(rename = "PrereqIds", default, skip_serializing_if = "Vec::is_empty")]
    prereq_ids: Vec<String>,
    #[serde(rename = "PrereqName", default)]
    prereq_name: String,
    #[serde(rename = "PrereqPath", default)]
    prereq_path: String,
    #[serde(rename = "PrereqArgs", default)]
    prereq_args: String,
    #[serde(rename = "FileManifestList", default)]
    file_manifest_list: Vec<JsonFileManifest>,
    #[serde(rename = "ChunkHashList", default)]
    chunk_hash_list: BTreeMap<String, String>,
    #[serde(rename = "ChunkShaList", default, skip_serializing_if = "BTreeMap::is_empty")]
    chunk_sha_list: BTreeMap<String, String>,
    #[serde(rename = "DataGroupList", default)]
    data_group_list: BTreeMap<String, String>,
    #[serde(rename = "ChunkFilesizeList", default)]
    chunk_filesize_list: BTreeMap<String, String>,
    #[serde(rename = "CustomFields", default, skip_serializing_if = "BTreeMap::is_empty")]
    custom_fields: BTreeMap<String, String>,
}

impl From<&Manifest> for JsonManifest {
    fn from(manifest: &Manifest) -> Self {
        let file_manifest_list = manifest
            .file_manifest_list
            .iter()
            .map(|file| JsonFileManifest {
                filename: file.filename.clone(),
                file_hash: to_blob(&file.file_hash),
                file_chunk_parts: file
                    .file_chunk_parts
                    .iter()
                    .map(|part| JsonChunkPart {
                        guid: part.guid.to_string(),
                        offset: to_blob(&part.offset.to_le_bytes()),
                        size: to_blob(&part.size.to_le_bytes()),
                    })
                    .collect(),
                install_tags: file.install_tags.clone(),
                is_unix_executable: file.is_unix_executable,
                symlink_target: file.symlink_target.clone(),
                is_read_only: file.is_read_only,
                is_compressed: file.is_compressed,
            })
            .collect();

        let mut chunk_hash_list = BTreeMap::new();
        let mut chunk_sha_list = BTreeMap::new();
        let mut data_group_list = BTreeMap::new();
        let mut chunk_filesize_list = BTreeMap::new();
        for info in &manifest.chunk_list {
            let key = info.guid.to_string();
            chunk_hash_list.insert(key.clone(), to_blob(&info.hash.to_le_bytes()));
            if info.has_sha() {
                chunk_sha_list.insert(key.clone(), hex::encode_upper(info.sha_hash));
            }
            data_group_list.insert(key.clone(), to_blob(&[info.group_number]));
            chunk_filesize_list.insert(key, to_blob(&info.file_size.to_le_bytes()));
        }

        Self {
            manifest_file_version: to_blob(&manifest.manifest_version.as_i32().to_le_bytes()),
            is_file_data: manifest.is_file_data,
            app_id: to_blob(&manifest.app_id.to_le_bytes()),
            app_name: manifest.app_name.clone(),
            build_version: manifest.build_version.clone(),
            launch_exe: manifest.launch_exe.clone(),
            launch_command: manifest.launch_command.clone(),
            prereq_ids: manifest.prereq_ids.clone(),
            prereq_name: manifest.prereq_name.clone(),
            prereq_path: manifest.prereq_path.clone(),
            prereq_args: manifest.prereq_args.clone(),
            file_manifest_list,
            chunk_hash_list,
            chunk_sha_list,
            data_group_list,
            chunk_filesize_list,
            custom_fields: manifest.custom_fields.clone(),
        }
    }
}

impl JsonManifest {
    fn into_manifest(self) -> Result<Manifest, BuildPatchError> {
        let manifest_version = ManifestVersion::from_i32(blob_to_u32(&self.manifest_file_version)? as i32)?;

        let mut file_manifest_list = Vec::with_capacity(self.file_manifest_list.len());
        for file in self.file_manifest_list {
            let mut parts = Vec::with_capacity(file.file_chunk_parts.len());
            for part in file.file_chunk_parts {
                parts.push(ChunkPartData {
                    guid: part.guid.parse()?,
                    offset: blob_to_u32(&part.offset)?,
                    size: blob_to_u32(&part.size)?,
                });
            }
            file_manifest_list.push(FileManifestData {
                filename: file.filename,
                file_hash: blob_to_array::<20>(&file.file_hash)?,
                file_chunk_parts: parts,
                install_tags: file.install_tags,
                is_unix_executable: file.is_unix_executable,
                is_read_only: file.is_read_only,
                is_compressed: file.is_compressed,
                symlink_target: file.symlink_target,
            });
        }

        let mut chunk_list = Vec::with_capacity(self.chunk_hash_list.len());
        for (key, hash_blob) in &self.chunk_hash_list {
            let guid: Guid = key.parse()?;
            let sha_hash = match self.chunk_sha_list.get(key) {
                Some(text) => hex_to_sha(text)?,
                None => [0u8; 20],
            };
            let group_number = match self.data_group_list.get(key) {
                Some(text) => blob_to_array::<1>(text)?[0],
                None => guid.group_number(),
            };
            let file_size = match self.chunk_filesize_list.get(key) {
                Some(text) => blob_to_u64(text)?,
                None => 0,
            };
            chunk_list.push(ChunkInfoData {
                guid,
                hash: blob_to_u64(hash_blob)?,
                sha_hash,
                file_size,
                group_number,
            });
        }

        Ok(Manifest {
            manifest_version,
            is_file_data: self.is_file_data,
            app_id: blob_to_u32(&self.app_id)?,
            app_name: self.app_name,
            build_version: self.build_version,
            launch_exe: self.launch_exe,
            launch_command: self.launch_command,
            prereq_ids: self.prereq_ids,
            prereq_name: self.prereq_name,
            prereq_path: self.prereq_path,
            prereq_args: self.prereq_args,
            file_manifest_list,
            chunk_list,
            custom_fields: self.custom_fields,
        })
    }
}
