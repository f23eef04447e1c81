use std::{
    fs,
    path::Path,
    sync::{Arc, atomic::AtomicBool},
};

use buildpatch::{
    BlockStructure, BuildPatchError, CHUNK_DATA_SIZE, GenerationSettings, Manifest,
    ManifestFormat, SearchDirection, generate_chunks_manifest_from_directory, load_chunk_file,
};

fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
    let mut state = seed | 1;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 7;
            state ^= state << 17;
            (state >> 24) as u8
        })
        .collect()
}

/// Rebuilds a file of `manifest` from the chunks in `cloud_dir`.
fn reconstruct(manifest: &Manifest, cloud_dir: &Path, filename: &str) -> Vec<u8> {
    let file = manifest.get_file_manifest(filename).unwrap();
    let mut out = Vec::new();
    for part in &file.file_chunk_parts {
        let path = manifest.get_data_filename(cloud_dir, &part.guid).unwrap();
        let (_, data) = load_chunk_file(&path).unwrap();
        let start = part.offset as usize;
        out.extend_from_slice(&data[start..start + part.size as usize]);
    }
    out
}

/// Union of all chunk parts in build space, files laid out in list order.
fn build_coverage(manifest: &Manifest) -> BlockStructure {
    let mut coverage = BlockStructure::new();
    let mut offset = 0;
    for file in &manifest.file_manifest_list {
        for part in &file.file_chunk_parts {
            coverage.add(offset, u64::from(part.size), SearchDirection::FromEnd);
            offset += u64::from(part.size);
        }
    }
    coverage
}

#[test]
fn test_single_file_mints_three_chunks() {
    let build = tempfile::tempdir().unwrap();
    let cloud = tempfile::tempdir().unwrap();
    let size = CHUNK_DATA_SIZE * 5 / 2;
    let content = pseudo_random(size, 42);
    fs::write(build.path().join("game.pak"), &content).unwrap();

    let settings = GenerationSettings::new(build.path(), cloud.path(), "Game_1.manifest")
        .app_name("Game")
        .build_version("1.0")
        .worker_threads(2);
    let summary = generate_chunks_manifest_from_directory(&settings).unwrap();

    assert_eq!(summary.new_chunks, 3);
    assert_eq!(summary.reused_chunks, 0);
    assert_eq!(summary.build_size, size as u64);

    let manifest = Manifest::load_from_file(&summary.manifest_path).unwrap();
    assert_eq!(manifest.file_manifest_list.len(), 1);
    assert_eq!(manifest.chunk_list.len(), 3);

    let parts = &manifest.file_manifest_list[0].file_chunk_parts;
    assert_eq!(parts.len(), 3);
    assert_eq!(parts.iter().map(|part| u64::from(part.size)).sum::<u64>(), size as u64);
    assert!(parts.iter().all(|part| part.offset == 0));
    assert_eq!(parts[2].size as usize, CHUNK_DATA_SIZE / 2);

    assert_eq!(build_coverage(&manifest), BlockStructure::from_block(0, size as u64));
    assert_eq!(reconstruct(&manifest, cloud.path(), "game.pak"), content);
}

#[test]
fn test_regeneration_reuses_chunks() {
    let build = tempfile::tempdir().unwrap();
    let cloud = tempfile::tempdir().unwrap();
    fs::create_dir_all(build.path().join("Content")).unwrap();
    fs::write(build.path().join("Content/a.bin"), pseudo_random(CHUNK_DATA_SIZE + 4000, 1)).unwrap();
    fs::write(build.path().join("readme.txt"), b"hello").unwrap();
    fs::write(build.path().join("empty.dat"), b"").unwrap();

    let first = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), cloud.path(), "first.manifest").worker_threads(2),
    )
    .unwrap();
    let second = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), cloud.path(), "second.manifest")
            .worker_threads(2)
            .output_format(ManifestFormat::Binary),
    )
    .unwrap();

    assert!(first.new_chunks > 0);
    assert_eq!(second.new_chunks, 0);
    assert_eq!(second.reused_chunks, first.new_chunks);

    let first = Manifest::load_from_file(&first.manifest_path).unwrap();
    let second = Manifest::load_from_file(&second.manifest_path).unwrap();
    assert_eq!(first.file_manifest_list, second.file_manifest_list);
    assert_eq!(first.chunk_list, second.chunk_list);

    let empty = second.get_file_manifest("empty.dat").unwrap();
    assert!(empty.file_chunk_parts.is_empty());
}

#[test]
fn test_shifted_data_matches_and_rescans_leftovers() {
    let cloud = tempfile::tempdir().unwrap();
    let shared = pseudo_random(CHUNK_DATA_SIZE * 3 / 2, 7);

    let first_build = tempfile::tempdir().unwrap();
    fs::write(first_build.path().join("data.bin"), &shared).unwrap();
    generate_chunks_manifest_from_directory(
        &GenerationSettings::new(first_build.path(), cloud.path(), "v1.manifest").worker_threads(2),
    )
    .unwrap();

    //The same data behind a short unknown prefix.
    let second_build = tempfile::tempdir().unwrap();
    let mut shifted = pseudo_random(1000, 99);
    shifted.extend_from_slice(&shared);
    fs::write(second_build.path().join("data.bin"), &shifted).unwrap();
    let summary = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(second_build.path(), cloud.path(), "v2.manifest").worker_threads(2),
    )
    .unwrap();

    //The first full chunk is found at offset 1000. The prefix and the tail
    //straddle it, so they are rescanned together and minted as one chunk.
    assert_eq!(summary.reused_chunks, 1);
    assert_eq!(summary.new_chunks, 1);
    assert_eq!(summary.num_layers, 2);
    assert_eq!(summary.matched_bytes, CHUNK_DATA_SIZE as u64);

    let manifest = Manifest::load_from_file(&summary.manifest_path).unwrap();
    let parts = &manifest.get_file_manifest("data.bin").unwrap().file_chunk_parts;
    assert_eq!(parts.len(), 3);
    assert_eq!(parts[0].guid, parts[2].guid);
    assert_eq!((parts[0].offset, parts[0].size), (0, 1000));
    assert_eq!(parts[2].offset, 1000);
    assert_eq!(reconstruct(&manifest, cloud.path(), "data.bin"), shifted);
}

#[test]
fn test_large_build_reuses_across_scanner_boundaries() {
    let cloud = tempfile::tempdir().unwrap();
    let original = pseudo_random(CHUNK_DATA_SIZE * 20, 1234);

    let first_build = tempfile::tempdir().unwrap();
    fs::write(first_build.path().join("big.pak"), &original).unwrap();
    let first = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(first_build.path(), cloud.path(), "v1.manifest").worker_threads(4),
    )
    .unwrap();
    assert_eq!(first.new_chunks, 20);
    let first = Manifest::load_from_file(&first.manifest_path).unwrap();
    let first_parts = &first.get_file_manifest("big.pak").unwrap().file_chunk_parts;

    //Unknown bytes in front and an insertion just before the first scanner
    //boundary, so matches sit at offsets no chunk was minted at.
    let insert_at = CHUNK_DATA_SIZE * 8 - 100;
    let mut changed = pseudo_random(333, 77);
    changed.extend_from_slice(&original[..insert_at]);
    changed.extend(pseudo_random(5000, 78));
    changed.extend_from_slice(&original[insert_at..]);

    let second_build = tempfile::tempdir().unwrap();
    fs::write(second_build.path().join("big.pak"), &changed).unwrap();
    let summary = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(second_build.path(), cloud.path(), "v2.manifest").worker_threads(4),
    )
    .unwrap();

    assert!(summary.num_scanners >= 3, "scanners: {}", summary.num_scanners);
    assert!(summary.num_layers >= 2);
    assert!(summary.new_chunks <= 3, "new chunks: {}", summary.new_chunks);
    assert!(summary.reused_chunks >= 17, "reused chunks: {}", summary.reused_chunks);
    assert!(summary.matched_bytes >= (CHUNK_DATA_SIZE * 17) as u64);

    let manifest = Manifest::load_from_file(&summary.manifest_path).unwrap();
    assert_eq!(
        build_coverage(&manifest),
        BlockStructure::from_block(0, changed.len() as u64)
    );
    assert_eq!(reconstruct(&manifest, cloud.path(), "big.pak"), changed);

    //Chunks from before and after the insertion are both reused.
    let used: Vec<_> = manifest
        .get_file_manifest("big.pak")
        .unwrap()
        .file_chunk_parts
        .iter()
        .map(|part| part.guid)
        .collect();
    assert!(used.contains(&first_parts[0].guid));
    assert!(used.contains(&first_parts[6].guid));
    assert!(used.contains(&first_parts[10].guid));
    assert!(used.contains(&first_parts[19].guid));
}

#[test]
fn test_ignore_and_attribute_lists_applied() {
    let build = tempfile::tempdir().unwrap();
    let cloud = tempfile::tempdir().unwrap();
    let lists = tempfile::tempdir().unwrap();
    fs::create_dir_all(build.path().join("Bin")).unwrap();
    fs::write(build.path().join("Bin/Game"), pseudo_random(5000, 3)).unwrap();
    fs::write(build.path().join("debug.log"), b"noise").unwrap();

    let ignore = lists.path().join("ignore.txt");
    fs::write(&ignore, "debug.log\t2024-01-01\n").unwrap();
    let attributes = lists.path().join("attributes.txt");
    fs::write(&attributes, "\"Bin/Game\" executable readonly tag:Core\n").unwrap();

    let settings = GenerationSettings::new(build.path(), cloud.path(), "game.manifest")
        .launch("Bin/Game", "-fullscreen")
        .prerequisites(vec!["redist".to_string()], "Redist", "bin/game", "/quiet")
        .ignore_list_file(&ignore)
        .attribute_list_file(&attributes)
        .custom_fields([("Channel".to_string(), "Beta".to_string())].into_iter().collect());
    let summary = generate_chunks_manifest_from_directory(&settings).unwrap();

    let manifest = Manifest::load_from_file(&summary.manifest_path).unwrap();
    assert_eq!(manifest.file_manifest_list.len(), 1);
    let game = manifest.get_file_manifest("Bin/Game").unwrap();
    assert!(game.is_unix_executable && game.is_read_only);
    assert_eq!(game.install_tags, vec!["Core".to_string()]);
    assert_eq!(manifest.launch_command, "-fullscreen");
    assert_eq!(manifest.prereq_ids, vec!["redist".to_string()]);
    assert_eq!(manifest.custom_fields["Channel"], "Beta");
}

#[test]
fn test_cloud_dir_inside_build_is_excluded() {
    let build = tempfile::tempdir().unwrap();
    let cloud = build.path().join("CloudDir");
    fs::write(build.path().join("a.bin"), pseudo_random(3000, 5)).unwrap();

    let summary = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), &cloud, "a.manifest"),
    )
    .unwrap();
    let first = Manifest::load_from_file(&summary.manifest_path).unwrap();
    assert_eq!(first.file_manifest_list.len(), 1);

    //Running again must not pick up the chunks and manifest written above.
    let summary = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), &cloud, "b.manifest"),
    )
    .unwrap();
    let second = Manifest::load_from_file(&summary.manifest_path).unwrap();
    assert_eq!(second.file_manifest_list, first.file_manifest_list);
}

#[test]
fn test_fatal_conditions() {
    let build = tempfile::tempdir().unwrap();
    let cloud = tempfile::tempdir().unwrap();

    fs::write(build.path().join("empty"), b"").unwrap();
    let result = generate_chunks_manifest_from_directory(&GenerationSettings::new(
        build.path(),
        cloud.path(),
        "x.manifest",
    ));
    assert!(matches!(result, Err(BuildPatchError::NoBuildData(_))));

    fs::write(build.path().join("data"), b"some bytes").unwrap();
    let result = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), cloud.path(), "x.manifest").prerequisites(
            Vec::new(),
            "Redist",
            "redist/setup.exe",
            "",
        ),
    );
    assert!(matches!(result, Err(BuildPatchError::MissingPrerequisite(_))));

    let result = generate_chunks_manifest_from_directory(
        &GenerationSettings::new(build.path(), cloud.path(), "x.manifest")
            .cancel_flag(Arc::new(AtomicBool::new(true))),
    );
    assert!(matches!(result, Err(BuildPatchError::Cancelled)));
    assert!(!cloud.path().join("x.manifest").exists());
}

#[test]
fn test_corrupt_cloud_manifest_is_fatal() {
    let build = tempfile::tempdir().unwrap();
    let cloud = tempfile::tempdir().unwrap();
    fs::write(build.path().join("data"), b"bytes").unwrap();
    fs::write(cloud.path().join("broken.manifest"), b"\x00\x01\x02").unwrap();

    let result = generate_chunks_manifest_from_directory(&GenerationSettings::new(
        build.path(),
        cloud.path(),
        "x.manifest",
    ));
    assert!(matches!(result, Err(BuildPatchError::CloudEnumerationError(_))));
}
