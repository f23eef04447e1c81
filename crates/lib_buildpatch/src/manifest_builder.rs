//! Turns chunk matches into a manifest.
//!
//! During generation every chunk that was found in, or minted from, the
//! build is reported together with the build space bytes it covers. Once
//! the build has been fully read, those ranges are cut along file
//! boundaries into per file chunk part lists. The builder refuses
//! overlapping coverage and refuses to finalize a build with holes in it,
//! so a saved manifest always reproduces the whole build.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
};

use tracing::debug;

use crate::{
    block_structure::BlockStructure,
    file_lists::FileAttributes,
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::{ChunkInfoData, ChunkPartData, FileManifestData, FileSpan},
    manifest::{Manifest, ManifestFormat, ManifestVersion},
    utils::normalize_build_path,
};

/// Build level metadata copied into the manifest.
///
/// `file_attributes` is keyed by normalized build relative path, as
/// returned by `file_lists::parse_attribute_list`.
#[derive(Clone, Debug, Default)]
pub struct ManifestDetails {
    pub app_id: u32,
    pub app_name: String,
    pub build_version: String,
    pub launch_exe: String,
    pub launch_command: String,
    pub prereq_ids: Vec<String>,
    pub prereq_name: String,
    pub prereq_path: String,
    pub prereq_args: String,
    pub custom_fields: BTreeMap<String, String>,
    pub file_attributes: HashMap<String, FileAttributes>,
}

/// A contiguous build range served by one contiguous range of a chunk.
#[derive(Clone, Copy, Debug)]
struct MatchPiece {
    build_offset: u64,
    size: u64,
    guid: Guid,
    chunk_offset: u64,
}

impl MatchPiece {
    fn end(&self) -> u64 {
        self.build_offset + self.size
    }
}

pub struct ManifestBuilder {
    details: ManifestDetails,
    all_matches: HashMap<Guid, Vec<BlockStructure>>,
    build_coverage: BlockStructure,
    manifest: Option<Manifest>,
}

impl ManifestBuilder {
    pub fn new(details: ManifestDetails) -> Self {
        Self {
            details,
            all_matches: HashMap::new(),
            build_coverage: BlockStructure::new(),
            manifest: None,
        }
    }

    /// Records that `structure`, in build space, is served by chunk `guid`.
    ///
    /// Reading the blocks of `structure` in order yields the chunk's data
    /// from its first byte onwards.
    ///
    /// # Errors
    ///
    /// Returns `ConsistencyError` if any byte of `structure` is already
    /// served by another match.
    pub fn add_chunk_match(
        &mut self,
        guid: Guid,
        structure: BlockStructure,
    ) -> Result<(), BuildPatchError> {
        let overlap = self.build_coverage.intersect(&structure);
        if let Some(first) = overlap.head() {
            return Err(BuildPatchError::ConsistencyError(format!(
                "Chunk {guid} overlaps existing coverage at build offset {}",
                first.offset()
            )));
        }

        self.build_coverage.add_structure(&structure);
        self.all_matches.entry(guid).or_default().push(structure);
        Ok(())
    }

    /// GUIDs of every chunk that has at least one match.
    pub fn matched_guids(&self) -> HashSet<Guid> {
        self.all_matches.keys().copied().collect()
    }

    /// Total number of build bytes covered so far.
    pub fn covered_bytes(&self) -> u64 {
        self.build_coverage.total_size()
    }

    /// Builds the file and chunk lists.
    ///
    /// # Arguments
    ///
    /// * `file_spans`: Every file of the build in stream order.
    /// * `chunk_infos`: Metadata for, at least, every matched chunk.
    ///
    /// # Returns
    ///
    /// An error if the matches leave a hole in any file, if the coverage
    /// is not exactly the build, or if a referenced chunk has no metadata.
    pub fn finalize_data(
        &mut self,
        file_spans: &[FileSpan],
        chunk_infos: Vec<ChunkInfoData>,
    ) -> Result<(), BuildPatchError> {
        let build_size = file_spans.iter().map(FileSpan::end_idx).max().unwrap_or(0);
        self.check_coverage(build_size)?;

        let pieces = self.collect_pieces();
        let mut file_manifest_list = Vec::with_capacity(file_spans.len());
        for span in file_spans {
            let mut file = FileManifestData {
                filename: span.filename.clone(),
                file_hash: span.sha_hash,
                file_chunk_parts: file_parts(span, &pieces)?,
                is_unix_executable: span.is_unix_executable,
                symlink_target: span.symlink_target.clone(),
                ..Default::default()
            };
            if let Some(attributes) = self
                .details
                .file_attributes
                .get(&normalize_build_path(&span.filename))
            {
                file.is_read_only = attributes.read_only;
                file.is_compressed = attributes.compressed;
                file.is_unix_executable |= attributes.unix_executable;
                file.install_tags = attributes.install_tags.iter().cloned().collect();
            }
            file_manifest_list.push(file);
        }

        let mut infos: HashMap<Guid, ChunkInfoData> =
            chunk_infos.into_iter().map(|info| (info.guid, info)).collect();
        let referenced: HashSet<Guid> = file_manifest_list
            .iter()
            .flat_map(|file| file.file_chunk_parts.iter().map(|part| part.guid))
            .collect();
        let mut chunk_list = referenced
            .into_iter()
            .map(|guid| {
                infos.remove(&guid).ok_or_else(|| {
                    BuildPatchError::ConsistencyError(format!(
                        "No hash metadata for referenced chunk {guid}"
                    ))
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        chunk_list.sort_by_key(|info| info.guid);

        let details = &self.details;
        debug!(
            "Finalized manifest with {} files and {} chunks.",
            file_manifest_list.len(),
            chunk_list.len()
        );
        self.manifest = Some(Manifest {
            manifest_version: ManifestVersion::LATEST,
            is_file_data: false,
            app_id: details.app_id,
            app_name: details.app_name.clone(),
            build_version: details.build_version.clone(),
            launch_exe: details.launch_exe.clone(),
            launch_command: details.launch_command.clone(),
            prereq_ids: details.prereq_ids.clone(),
            prereq_name: details.prereq_name.clone(),
            prereq_path: details.prereq_path.clone(),
            prereq_args: details.prereq_args.clone(),
            file_manifest_list,
            chunk_list,
            custom_fields: details.custom_fields.clone(),
        });
        Ok(())
    }

    pub fn get_manifest(&self) -> Option<&Manifest> {
        self.manifest.as_ref()
    }

    /// Writes the finalized manifest to `path`.
    pub fn save_to_file(&self, path: &Path, format: ManifestFormat) -> Result<(), BuildPatchError> {
        let manifest = self.manifest.as_ref().ok_or_else(|| {
            BuildPatchError::InternalLibError("Manifest saved before finalize_data".to_string())
        })?;
        self.check_coverage(manifest.get_build_size())?;
        manifest.save_to_file(path, format)
    }

    fn check_coverage(&self, build_size: u64) -> Result<(), BuildPatchError> {
        let expected = BlockStructure::from_block(0, build_size);
        if self.build_coverage != expected {
            return Err(BuildPatchError::ConsistencyError(format!(
                "Chunk coverage {:?} does not match build of {build_size} bytes",
                self.build_coverage
            )));
        }
        Ok(())
    }

    fn collect_pieces(&self) -> Vec<MatchPiece> {
        let mut pieces: Vec<MatchPiece> = self
            .all_matches
            .iter()
            .flat_map(|(guid, structures)| {
                structures.iter().flat_map(move |structure| {
                    let mut chunk_offset = 0;
                    structure.iter().map(move |block| {
                        let piece = MatchPiece {
                            build_offset: block.offset(),
                            size: block.size(),
                            guid: *guid,
                            chunk_offset,
                        };
                        chunk_offset += block.size();
                        piece
                    })
                })
            })
            .collect();
        pieces.sort_by_key(|piece| piece.build_offset);
        pieces
    }
}

/// Cuts the pieces covering `span` into chunk parts.
fn file_parts(span: &FileSpan, pieces: &[MatchPiece]) -> Result<Vec<ChunkPartData>, BuildPatchError> {
    let mut parts = Vec::new();
    let mut cursor = span.start_idx;
    let mut idx = pieces.partition_point(|piece| piece.end() <= cursor);

    while cursor < span.end_idx() {
        let piece = pieces
            .get(idx)
            .filter(|piece| piece.build_offset <= cursor)
            .ok_or_else(|| {
                BuildPatchError::ConsistencyError(format!(
                    "No chunk covers build offset {cursor} of {}",
                    span.filename
                ))
            })?;

        let skip = cursor - piece.build_offset;
        let take = piece.end().min(span.end_idx()) - cursor;
        parts.push(ChunkPartData {
            guid: piece.guid,
            offset: to_u32(piece.chunk_offset + skip)?,
            size: to_u32(take)?,
        });

        cursor += take;
        if cursor >= piece.end() {
            idx += 1;
        }
    }

    Ok(parts)
}

fn to_u32(value: u64) -> Result<u32, BuildPatchError> {
    u32::try_from(value).map_err(|_| {
        BuildPatchError::ConsistencyError(format!("Chunk part value {value} exceeds u32"))
    })
}
