//! Index of the chunks already present in a cloud directory.
//!
//! Generation reuses existing chunks wherever the build contains their
//! data. To find them it needs, for every rolling hash, the chunks that
//! carry it, plus each chunk's SHA-1 to rule out hash collisions. The
//! index is built from the manifests stored in the cloud directory root,
//! then shared read only between all scanner threads.

use std::{
    collections::{HashMap, HashSet},
    fs,
    path::Path,
    time::{Duration, SystemTime},
};

use tracing::{debug, info};

use crate::{
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::ShaHash,
    manifest::Manifest,
    utils::MANIFEST_EXTENSION,
};

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Immutable snapshot of reusable chunks.
#[derive(Debug, Default)]
pub struct CloudEnumeration {
    chunk_inventory: HashMap<u64, HashSet<Guid>>,
    chunk_sha_hashes: HashMap<Guid, ShaHash>,
    chunk_file_sizes: HashMap<Guid, u64>,
    chunk_hashes: HashMap<Guid, u64>,
    num_manifests: usize,
}

impl CloudEnumeration {
    /// Builds the index for `cloud_dir`.
    ///
    /// Only manifests modified within the last `manifest_age_threshold`
    /// days are read, so data that compactify may soon remove is not
    /// reused. Chunks without a SHA-1 cannot be matched safely and are
    /// left out.
    ///
    /// # Errors
    ///
    /// Any manifest that cannot be read or parsed aborts the enumeration
    /// with `CloudEnumerationError`.
    pub fn new(cloud_dir: &Path, manifest_age_threshold: f64) -> Result<Self, BuildPatchError> {
        let mut enumeration = Self::default();
        if !cloud_dir.is_dir() {
            debug!("Cloud directory {} does not exist yet.", cloud_dir.display());
            return Ok(enumeration);
        }

        let cutoff = SystemTime::now()
            .checked_sub(Duration::from_secs_f64(manifest_age_threshold.max(0.0) * SECONDS_PER_DAY))
            .unwrap_or(SystemTime::UNIX_EPOCH);

        for entry in fs::read_dir(cloud_dir)? {
            let path = entry?.path();
            let is_manifest = path.is_file()
                && path
                    .extension()
                    .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION));
            if !is_manifest {
                continue;
            }

            let modified = fs::metadata(&path)?.modified()?;
            if modified < cutoff {
                debug!("Skipping old manifest {}", path.display());
                continue;
            }

            let manifest = Manifest::load_from_file(&path).map_err(|e| {
                BuildPatchError::CloudEnumerationError(format!(
                    "Could not load manifest {}: {e}",
                    path.display()
                ))
            })?;
            enumeration.add_manifest(&manifest);
        }

        info!(
            "Enumerated {} manifests with {} reusable chunks.",
            enumeration.num_manifests,
            enumeration.num_chunks()
        );
        Ok(enumeration)
    }

    /// Adds the chunks of one manifest to the index.
    pub fn add_manifest(&mut self, manifest: &Manifest) {
        self.num_manifests += 1;
        if manifest.is_file_data {
            return;
        }
        for info in manifest.chunk_list.iter().filter(|info| info.has_sha()) {
            self.chunk_inventory.entry(info.hash).or_default().insert(info.guid);
            self.chunk_sha_hashes.insert(info.guid, info.sha_hash);
            self.chunk_file_sizes.insert(info.guid, info.file_size);
            self.chunk_hashes.insert(info.guid, info.hash);
        }
    }

    pub fn get_chunk_inventory(&self) -> &HashMap<u64, HashSet<Guid>> {
        &self.chunk_inventory
    }

    pub fn get_chunk_sha_hashes(&self) -> &HashMap<Guid, ShaHash> {
        &self.chunk_sha_hashes
    }

    pub fn get_chunk_file_sizes(&self) -> &HashMap<Guid, u64> {
        &self.chunk_file_sizes
    }

    pub fn get_chunk_hashes(&self) -> &HashMap<Guid, u64> {
        &self.chunk_hashes
    }

    pub fn num_chunks(&self) -> usize {
        self.chunk_sha_hashes.len()
    }

    pub fn num_manifests(&self) -> usize {
        self.num_manifests
    }

    pub fn is_empty(&self) -> bool {
        self.chunk_sha_hashes.is_empty()
    }
}
