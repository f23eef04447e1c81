//! Removes chunk and file data that no manifest refers to.
//!
//! Only data older than an age threshold is removed, so chunks written by
//! a generation run whose manifest is not saved yet are left alone.

use std::{
    collections::HashSet,
    fs,
    path::{Path, PathBuf},
    time::{Duration, SystemTime},
};

use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::{
    guid::Guid,
    lib_error_handling::BuildPatchError,
    manifest::Manifest,
    utils::{
        CHUNK_EXTENSION, FILE_EXTENSION, MANIFEST_EXTENSION, get_guid_from_filename,
        human_readable_size, relative_path_string,
    },
};

pub const DEFAULT_COMPACTIFY_AGE_THRESHOLD: f64 = 2.0;

const SECONDS_PER_DAY: f64 = 24.0 * 60.0 * 60.0;

/// Parameters of a compactify run.
///
/// # Fields
///
/// * `cloud_dir`: Directory holding the manifests and their data.
/// * `data_age_threshold`: Minimum age in days of data that may be
///   deleted.
/// * `preview`: Only report what would be deleted.
/// * `deleted_list`: Optional file receiving the relative paths of the
///   deleted (or, in preview, deletable) files, one per line.
#[derive(Clone, Debug)]
pub struct CompactifySettings {
    pub cloud_dir: PathBuf,
    pub data_age_threshold: f64,
    pub preview: bool,
    pub deleted_list: Option<PathBuf>,
}

impl CompactifySettings {
    pub fn new(cloud_dir: impl Into<PathBuf>) -> Self {
        Self {
            cloud_dir: cloud_dir.into(),
            data_age_threshold: DEFAULT_COMPACTIFY_AGE_THRESHOLD,
            preview: false,
            deleted_list: None,
        }
    }
}

/// What a compactify run found and did.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompactifySummary {
    pub num_manifests: usize,
    pub referenced_data: usize,
    pub data_files_seen: usize,
    pub data_files_kept_young: usize,
    pub deleted_files: Vec<String>,
    pub deleted_bytes: u64,
    pub failed_deletes: usize,
    pub other_files: usize,
    pub other_bytes: u64,
}

/// Loads every manifest in the cloud root and unions the data they use.
fn collect_referenced_data(cloud_dir: &Path) -> Result<(HashSet<Guid>, usize), BuildPatchError> {
    let mut referenced = HashSet::new();
    let mut num_manifests = 0;

    for entry in fs::read_dir(cloud_dir)? {
        let path = entry?.path();
        let is_manifest = path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION));
        if !is_manifest {
            continue;
        }

        //A manifest that cannot be read might reference anything, so
        //nothing can safely be deleted.
        let data_list = Manifest::load_from_file(&path)?.get_data_list();
        debug!("Manifest {} references {} data files.", path.display(), data_list.len());
        referenced.extend(data_list);
        num_manifests += 1;
    }

    Ok((referenced, num_manifests))
}

fn is_data_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| {
        ext.eq_ignore_ascii_case(CHUNK_EXTENSION) || ext.eq_ignore_ascii_case(FILE_EXTENSION)
    })
}

/// Deletes unreferenced data older than the threshold.
///
/// # Arguments
///
/// * `settings`: The cloud directory and deletion policy.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(CompactifySummary)` after every data file was considered. Files
///   that could not be deleted are counted in `failed_deletes`.
/// - `Err(BuildPatchError)` if a manifest could not be loaded, in which
///   case nothing was deleted, or the directory could not be walked.
pub fn compactify_cloud_directory(
    settings: &CompactifySettings,
) -> Result<CompactifySummary, BuildPatchError> {
    let cloud_dir = &settings.cloud_dir;
    info!(
        "Compactifying {}{}.",
        cloud_dir.display(),
        if settings.preview { " (preview)" } else { "" }
    );

    let (referenced, num_manifests) = collect_referenced_data(cloud_dir)?;
    let mut summary = CompactifySummary {
        num_manifests,
        referenced_data: referenced.len(),
        ..Default::default()
    };

    let cutoff = SystemTime::now()
        .checked_sub(Duration::from_secs_f64(
            settings.data_age_threshold.max(0.0) * SECONDS_PER_DAY,
        ))
        .unwrap_or(SystemTime::UNIX_EPOCH);

    for entry in WalkDir::new(cloud_dir).sort_by_file_name() {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let path = entry.path();
        let metadata = entry.metadata()?;

        let guid = if is_data_file(path) {
            get_guid_from_filename(path)
        } else {
            None
        };
        let Some(guid) = guid else {
            let is_manifest = path
                .extension()
                .is_some_and(|ext| ext.eq_ignore_ascii_case(MANIFEST_EXTENSION));
            if !is_manifest {
                summary.other_files += 1;
                summary.other_bytes += metadata.len();
            }
            continue;
        };

        summary.data_files_seen += 1;
        if referenced.contains(&guid) {
            continue;
        }
        if metadata.modified()? >= cutoff {
            summary.data_files_kept_young += 1;
            continue;
        }

        let relative = relative_path_string(cloud_dir, path);
        if settings.preview {
            info!("Would delete {relative}");
        } else if let Err(e) = fs::remove_file(path) {
            warn!("Failed to delete {relative}: {e}");
            summary.failed_deletes += 1;
            continue;
        } else {
            debug!("Deleted {relative}");
        }
        summary.deleted_bytes += metadata.len();
        summary.deleted_files.push(relative);
    }

    if let Some(list_path) = &settings.deleted_list {
        let mut text = summary.deleted_files.join("\n");
        if !text.is_empty() {
            text.push('\n');
        }
        fs::write(list_path, text)?;
    }

    info!(
        "{} {} unreferenced data files ({}). Kept {} young unreferenced files. \
         {} manifests reference {} data files. {} other files ({}).",
        if settings.preview { "Would delete" } else { "Deleted" },
        summary.deleted_files.len(),
        human_readable_size(summary.deleted_bytes),
        summary.data_files_kept_young,
        summary.num_manifests,
        summary.referenced_data,
        summary.other_files,
        human_readable_size(summary.other_bytes),
    );
    if summary.failed_deletes > 0 {
        warn!("{} files could not be deleted.", summary.failed_deletes);
    }

    Ok(summary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        lib_structs::{ChunkInfoData, ChunkPartData, FileManifestData},
        manifest::{ManifestFormat, ManifestVersion},
        utils::{get_chunk_new_filename, get_chunk_old_filename},
    };

    fn write_aged(path: &Path, age_days: u64) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"chunk").unwrap();
        let modified = SystemTime::now() - Duration::from_secs(age_days * 24 * 60 * 60);
        fs::File::options()
            .write(true)
            .open(path)
            .unwrap()
            .set_modified(modified)
            .unwrap();
    }

    fn manifest_referencing(guid: Guid) -> Manifest {
        let mut manifest = Manifest::new();
        manifest.file_manifest_list.push(FileManifestData {
            filename: "a".to_string(),
            file_chunk_parts: vec![ChunkPartData { guid, offset: 0, size: 5 }],
            ..Default::default()
        });
        manifest.chunk_list.push(ChunkInfoData {
            guid,
            hash: 1,
            sha_hash: [1; 20],
            file_size: 5,
            group_number: guid.group_number(),
        });
        manifest
    }

    #[test]
    fn test_deletes_old_unreferenced_only() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        let kept = Guid::new(1, 1, 1, 1);
        let old = Guid::new(2, 2, 2, 2);
        let young = Guid::new(3, 3, 3, 3);
        let legacy = Guid::new(4, 4, 4, 4);
        manifest_referencing(kept)
            .save_to_file(&root.join("build.manifest"), ManifestFormat::Json)
            .unwrap();

        let version = ManifestVersion::LATEST;
        write_aged(&get_chunk_new_filename(version, root, &kept, 1), 30);
        write_aged(&get_chunk_new_filename(version, root, &old, 2), 30);
        write_aged(&get_chunk_new_filename(version, root, &young, 3), 0);
        write_aged(&get_chunk_old_filename(root, &legacy), 30);
        write_aged(&root.join("notes.txt"), 30);

        let mut settings = CompactifySettings::new(root);
        settings.deleted_list = Some(root.join("deleted.txt"));
        let summary = compactify_cloud_directory(&settings).unwrap();

        assert_eq!(summary.deleted_files.len(), 2);
        assert!(!get_chunk_new_filename(version, root, &old, 2).exists());
        assert!(!get_chunk_old_filename(root, &legacy).exists());
        assert!(get_chunk_new_filename(version, root, &kept, 1).exists());
        assert!(get_chunk_new_filename(version, root, &young, 3).exists());
        assert_eq!(summary.data_files_kept_young, 1);
        assert_eq!(summary.other_files, 1);

        let listed = fs::read_to_string(root.join("deleted.txt")).unwrap();
        assert_eq!(listed.lines().count(), 2);
        assert!(listed.lines().all(|line| !line.starts_with('/')));
    }

    #[test]
    fn test_unreadable_manifest_deletes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let orphan = get_chunk_old_filename(dir.path(), &Guid::new(5, 5, 5, 5));
        write_aged(&orphan, 30);
        fs::write(dir.path().join("broken.manifest"), b"garbage").unwrap();

        assert!(compactify_cloud_directory(&CompactifySettings::new(dir.path())).is_err());
        assert!(orphan.exists());
    }
}
