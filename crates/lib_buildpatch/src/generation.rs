//! Drives a build directory through scanning, chunking and manifest
//! creation.
//!
//! The build is read as one byte stream and cut into overlapping scanner
//! buffers. Scanners look for chunks that already exist in the cloud
//! directory. Bytes nobody matched are collected as unknown data and,
//! whenever a full chunk's worth is available, minted into new chunks.
//!
//! Unknown data is only minted directly when it is contiguous in the
//! layer it was found in. A batch that straddles a match is handed to the
//! next layer instead, where it is scanned again as one continuous
//! stream. Layer N+1 therefore sees the leftovers of layer N laid end to
//! end. This cascades until a layer finds no more matches, at which point
//! all of its unknown data is contiguous and gets minted.
//!
//! Every layer's stream is an ascending subsequence of the build, so the
//! mapping from layer offsets to build offsets is a `BlockStructure` in
//! build space read serially.

use std::{
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    fs,
    path::PathBuf,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use tracing::{debug, info, warn};

use crate::{
    block_structure::{BlockStructure, SearchDirection},
    build_streamer::{BuildStreamer, BuildStreamerSettings},
    chunk_data::{CHUNK_DATA_SIZE, sha1_digest},
    chunk_writer::ChunkWriter,
    cloud_enumeration::CloudEnumeration,
    data_scanner::{DataScanner, ScannerCounters},
    file_lists::{load_attribute_list, load_ignore_list},
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::{ChunkInfoData, FileSpan, ShaHash},
    manifest::{ManifestFormat, ManifestVersion},
    manifest_builder::{ManifestBuilder, ManifestDetails},
    rolling_hash::RollingHash,
    utils::{human_readable_size, normalize_build_path},
};

/// Bytes handed to each scanner.
pub const SCANNER_DATA_SIZE: usize = CHUNK_DATA_SIZE * 8;

/// Bytes shared between consecutive scanner buffers of a layer, so a chunk
/// straddling two buffers is still seen whole by one of them.
pub const SCANNER_OVERLAP: usize = CHUNK_DATA_SIZE - 1;

pub const DEFAULT_DATA_AGE_THRESHOLD: f64 = 5.0;
pub const DEFAULT_SCANNER_BACKLOG: usize = 75;
pub const MIN_SCANNER_BACKLOG: usize = 5;
pub const MAX_SCANNER_BACKLOG: usize = 500;

const STATS_INTERVAL: Duration = Duration::from_secs(10);
const IDLE_SLEEP: Duration = Duration::from_millis(1);

/// Parameters of a generation run.
///
/// Created with the required paths, then refined with the chained
/// setters below.
#[derive(Clone, Debug)]
pub struct GenerationSettings {
    root_directory: PathBuf,
    cloud_directory: PathBuf,
    manifest_filename: String,
    details: ManifestDetails,
    ignore_list_file: Option<PathBuf>,
    attribute_list_file: Option<PathBuf>,
    data_age_threshold: f64,
    scanner_backlog: usize,
    worker_threads: usize,
    output_format: ManifestFormat,
    cancel: Arc<AtomicBool>,
}

impl GenerationSettings {
    pub fn new(
        root_directory: impl Into<PathBuf>,
        cloud_directory: impl Into<PathBuf>,
        manifest_filename: impl Into<String>,
    ) -> Self {
        Self {
            root_directory: root_directory.into(),
            cloud_directory: cloud_directory.into(),
            manifest_filename: manifest_filename.into(),
            //Set default values for optional parameters
            details: ManifestDetails::default(),
            ignore_list_file: None,
            attribute_list_file: None,
            data_age_threshold: DEFAULT_DATA_AGE_THRESHOLD,
            scanner_backlog: DEFAULT_SCANNER_BACKLOG,
            worker_threads: 0, //Let Rayon decide
            output_format: ManifestFormat::Json,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn app_id(mut self, app_id: u32) -> Self {
        self.details.app_id = app_id;
        self
    }

    pub fn app_name(mut self, app_name: impl Into<String>) -> Self {
        self.details.app_name = app_name.into();
        self
    }

    pub fn build_version(mut self, build_version: impl Into<String>) -> Self {
        self.details.build_version = build_version.into();
        self
    }

    /// Sets the executable and command line used to launch the build.
    pub fn launch(mut self, exe: impl Into<String>, command: impl Into<String>) -> Self {
        self.details.launch_exe = exe.into();
        self.details.launch_command = command.into();
        self
    }

    /// Sets the prerequisite installer information.
    ///
    /// `path` must name a file of the build when it is not empty.
    pub fn prerequisites(
        mut self,
        ids: Vec<String>,
        name: impl Into<String>,
        path: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        self.details.prereq_ids = ids;
        self.details.prereq_name = name.into();
        self.details.prereq_path = path.into();
        self.details.prereq_args = args.into();
        self
    }

    pub fn ignore_list_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ignore_list_file = Some(path.into());
        self
    }

    pub fn attribute_list_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.attribute_list_file = Some(path.into());
        self
    }

    pub fn custom_fields(mut self, fields: BTreeMap<String, String>) -> Self {
        self.details.custom_fields.extend(fields);
        self
    }

    /// Only chunks from manifests modified within this many days are
    /// reused. The default is `5`.
    pub fn data_age_threshold(mut self, days: f64) -> Self {
        self.data_age_threshold = days;
        self
    }

    /// Caps the number of unfinished scanners, clamped to `[5, 500]`.
    ///
    /// The default value is `75`.
    pub fn scanner_backlog(mut self, backlog: usize) -> Self {
        self.scanner_backlog = backlog.clamp(MIN_SCANNER_BACKLOG, MAX_SCANNER_BACKLOG);
        self
    }

    /// Sets the number of scanner threads. `0` uses every core.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = threads;
        self
    }

    pub fn output_format(mut self, format: ManifestFormat) -> Self {
        self.output_format = format;
        self
    }

    /// Shares a flag that cancels the run once set.
    pub fn cancel_flag(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.cloud_directory.join(&self.manifest_filename)
    }
}

/// Outcome of a successful generation run.
#[derive(Clone, Debug, Default)]
pub struct GenerationSummary {
    pub num_files: usize,
    pub build_size: u64,
    pub new_chunks: usize,
    pub reused_chunks: usize,
    pub matched_bytes: u64,
    pub hash_collisions: u64,
    pub num_scanners: u64,
    pub num_layers: usize,
    pub manifest_path: PathBuf,
    pub elapsed: Duration,
}

/// Running totals, logged periodically.
#[derive(Debug, Default)]
struct GenerationStats {
    bytes_read: u64,
    scanners_created: u64,
    matches_accepted: u64,
    matched_bytes: u64,
    hash_collisions: u64,
    chunks_minted: u64,
    minted_reuses: u64,
}

/// A scanner in flight together with where its buffer sits in its layer.
struct PendingScan {
    scanner: DataScanner,
    data: Arc<Vec<u8>>,
    layer_offset: u64,
    authoritative_len: usize,
}

/// Unknown bytes passed on for rescanning, with their build ranges.
struct ForwardedData {
    data: Vec<u8>,
    build: BlockStructure,
}

/// Shared machinery every layer uses.
struct Generator<'a> {
    pool: rayon::ThreadPool,
    cloud: Arc<CloudEnumeration>,
    counters: Arc<ScannerCounters>,
    scanner_backlog: usize,
    num_threads: usize,
    builder: ManifestBuilder,
    writer: ChunkWriter,
    known_chunks: HashMap<u64, Vec<(Guid, ShaHash)>>,
    new_chunks: HashMap<Guid, (u64, ShaHash)>,
    stats: GenerationStats,
    cancel: &'a AtomicBool,
}

impl Generator<'_> {
    fn can_create_scanner(&self) -> bool {
        let incomplete = self.counters.num_incomplete();
        let waiting = incomplete.saturating_sub(self.counters.num_running());
        incomplete < self.scanner_backlog && waiting <= self.num_threads
    }

    fn start_scanner(&mut self, data: Vec<u8>) -> (DataScanner, Arc<Vec<u8>>) {
        let data = Arc::new(data);
        let scanner = DataScanner::new(
            Arc::clone(&data),
            Arc::clone(&self.cloud),
            Arc::clone(&self.counters),
            &self.pool,
        );
        self.stats.scanners_created += 1;
        (scanner, data)
    }

    /// Turns one chunk's worth of unknown bytes into a chunk and records
    /// it against `build`, the build ranges those bytes came from.
    ///
    /// Identical content already known, from the cloud or minted earlier
    /// in this run, is reused rather than written again.
    fn mint_chunk(&mut self, mut data: Vec<u8>, build: BlockStructure) -> Result<(), BuildPatchError> {
        data.resize(CHUNK_DATA_SIZE, 0);
        let hash = RollingHash::get_hash_for_data_set(&data);
        let sha_hash = sha1_digest(&data);

        let existing = self
            .known_chunks
            .get(&hash)
            .and_then(|chunks| chunks.iter().find(|(_, sha)| *sha == sha_hash))
            .map(|(guid, _)| *guid);

        let guid = match existing {
            Some(guid) => {
                self.stats.minted_reuses += 1;
                guid
            }
            None => {
                let guid = Guid::new_random();
                self.writer.queue_chunk(guid, hash, sha_hash, data)?;
                self.new_chunks.insert(guid, (hash, sha_hash));
                self.known_chunks.entry(hash).or_default().push((guid, sha_hash));
                self.stats.chunks_minted += 1;
                guid
            }
        };

        self.builder.add_chunk_match(guid, build)
    }

    fn log_stats(&self, layers: &[Layer]) {
        let buffered: usize = layers.iter().map(|layer| layer.input.len() + layer.unknown.len()).sum();
        info!(
            "Read {}, scanners {} ({} running, {} unfinished), matches {}, new chunks {}, \
             reused {}, collisions {}, layers {}, buffered {}.",
            human_readable_size(self.stats.bytes_read),
            self.stats.scanners_created,
            self.counters.num_running(),
            self.counters.num_incomplete(),
            self.stats.matches_accepted,
            self.stats.chunks_minted,
            self.stats.minted_reuses,
            self.stats.hash_collisions,
            layers.len(),
            human_readable_size(buffered as u64),
        );
    }
}

/// One rescanning level.
struct Layer {
    index: usize,
    //Bytes received but not yet handed to a scanner.
    input: Vec<u8>,
    input_offset: u64,
    //Build ranges of this layer's bytes from `mapping_base` onwards.
    mapping: BlockStructure,
    mapping_base: u64,
    scans: VecDeque<PendingScan>,
    //Everything before this layer offset is matched or unknown.
    processed_end: u64,
    unknown: Vec<u8>,
    unknown_layer: BlockStructure,
    unknown_build: BlockStructure,
    final_scan_created: bool,
    complete: bool,
}

impl Layer {
    fn new(index: usize) -> Self {
        Self {
            index,
            input: Vec::new(),
            input_offset: 0,
            mapping: BlockStructure::new(),
            mapping_base: 0,
            scans: VecDeque::new(),
            processed_end: 0,
            unknown: Vec::new(),
            unknown_layer: BlockStructure::new(),
            unknown_build: BlockStructure::new(),
            final_scan_created: false,
            complete: false,
        }
    }

    fn push_input(&mut self, data: &[u8], build: &BlockStructure) {
        self.input.extend_from_slice(data);
        self.mapping.add_structure(build);
    }

    /// Selects the build ranges of `size` layer bytes starting at `offset`.
    fn layer_to_build(
        &self,
        offset: u64,
        size: u64,
        out: &mut BlockStructure,
    ) -> Result<(), BuildPatchError> {
        let selected = self
            .mapping
            .select_serial_bytes(offset - self.mapping_base, size, out);
        if selected != size {
            return Err(BuildPatchError::ConsistencyError(format!(
                "Layer {} has no build mapping for {size} bytes at {offset}",
                self.index
            )));
        }
        Ok(())
    }

    fn add_unknown(&mut self, data: &[u8], layer_offset: u64) -> Result<(), BuildPatchError> {
        if data.is_empty() {
            return Ok(());
        }
        let size = data.len() as u64;
        let mut build = BlockStructure::new();
        self.layer_to_build(layer_offset, size, &mut build)?;

        self.unknown.extend_from_slice(data);
        self.unknown_layer.add(layer_offset, size, SearchDirection::FromEnd);
        self.unknown_build.add_structure(&build);
        Ok(())
    }

    /// Drops mapping entries for layer bytes that are fully processed.
    fn trim_mapping(&mut self) {
        let consumed_len = self.processed_end - self.mapping_base;
        if consumed_len == 0 {
            return;
        }
        let mut consumed = BlockStructure::new();
        self.mapping.select_serial_bytes(0, consumed_len, &mut consumed);
        self.mapping.remove_structure(&consumed);
        self.mapping_base = self.processed_end;
    }

    /// Hands buffered input to new scanners while throttling allows.
    fn create_scanners(&mut self, upstream_done: bool, generator: &mut Generator) -> bool {
        let mut progress = false;

        while self.input.len() >= SCANNER_DATA_SIZE && generator.can_create_scanner() {
            let data = self.input[..SCANNER_DATA_SIZE].to_vec();
            let authoritative_len = SCANNER_DATA_SIZE - SCANNER_OVERLAP;
            let (scanner, data) = generator.start_scanner(data);
            self.scans.push_back(PendingScan {
                scanner,
                data,
                layer_offset: self.input_offset,
                authoritative_len,
            });
            self.input.drain(..authoritative_len);
            self.input_offset += authoritative_len as u64;
            progress = true;
        }

        if upstream_done
            && !self.final_scan_created
            && self.input.len() < SCANNER_DATA_SIZE
            && generator.can_create_scanner()
        {
            let data = std::mem::take(&mut self.input);
            if !data.is_empty() {
                let authoritative_len = data.len();
                let (scanner, data) = generator.start_scanner(data);
                self.scans.push_back(PendingScan {
                    scanner,
                    data,
                    layer_offset: self.input_offset,
                    authoritative_len,
                });
                self.input_offset += authoritative_len as u64;
            }
            debug!("Layer {} received all of its input.", self.index);
            self.final_scan_created = true;
            progress = true;
        }

        progress
    }

    /// Applies the result of the oldest scan to the layer.
    fn process_scan(
        &mut self,
        mut scan: PendingScan,
        generator: &mut Generator,
    ) -> Result<(), BuildPatchError> {
        let result = scan.scanner.get_result_when_complete()?;
        generator.stats.hash_collisions += result.hash_collisions;

        let authoritative_end = scan.layer_offset + scan.authoritative_len as u64;
        let buffer_slice = |from: u64, to: u64| {
            &scan.data[(from - scan.layer_offset) as usize..(to - scan.layer_offset) as usize]
        };

        let mut cursor = self.processed_end.max(scan.layer_offset);
        for chunk_match in result.matches {
            let match_start = scan.layer_offset + chunk_match.data_offset;
            if match_start >= authoritative_end {
                //The next scanner sees this region from its start.
                break;
            }
            if match_start < cursor {
                continue;
            }

            self.add_unknown(buffer_slice(cursor, match_start), cursor)?;

            let mut build = BlockStructure::new();
            self.layer_to_build(match_start, CHUNK_DATA_SIZE as u64, &mut build)?;
            generator.builder.add_chunk_match(chunk_match.chunk_guid, build)?;
            generator.stats.matches_accepted += 1;
            generator.stats.matched_bytes += CHUNK_DATA_SIZE as u64;

            cursor = match_start + CHUNK_DATA_SIZE as u64;
        }

        if cursor < authoritative_end {
            self.add_unknown(buffer_slice(cursor, authoritative_end), cursor)?;
            cursor = authoritative_end;
        }

        self.processed_end = cursor;
        self.trim_mapping();
        Ok(())
    }

    /// Mints or forwards unknown data in chunk sized batches.
    ///
    /// Partial batches are only taken when `all` is set.
    fn flush_unknown(
        &mut self,
        all: bool,
        generator: &mut Generator,
    ) -> Result<Vec<ForwardedData>, BuildPatchError> {
        let mut forwarded = Vec::new();

        while self.unknown.len() >= CHUNK_DATA_SIZE || (all && !self.unknown.is_empty()) {
            let take = self.unknown.len().min(CHUNK_DATA_SIZE);
            let mut batch_layer = BlockStructure::new();
            let mut batch_build = BlockStructure::new();
            self.unknown_layer.select_serial_bytes(0, take as u64, &mut batch_layer);
            self.unknown_build.select_serial_bytes(0, take as u64, &mut batch_build);
            self.unknown_layer.remove_structure(&batch_layer);
            self.unknown_build.remove_structure(&batch_build);
            let data: Vec<u8> = self.unknown.drain(..take).collect();

            if batch_layer.num_blocks() > 1 {
                forwarded.push(ForwardedData {
                    data,
                    build: batch_build,
                });
            } else {
                generator.mint_chunk(data, batch_build)?;
            }
        }

        Ok(forwarded)
    }

    /// Advances the layer as far as it can without blocking.
    ///
    /// # Returns
    ///
    /// Whether anything changed, and the data to pass to the next layer.
    fn step(
        &mut self,
        upstream_done: bool,
        generator: &mut Generator,
    ) -> Result<(bool, Vec<ForwardedData>), BuildPatchError> {
        if self.complete {
            return Ok((false, Vec::new()));
        }

        let mut progress = self.create_scanners(upstream_done, generator);

        while self
            .scans
            .front_mut()
            .is_some_and(|scan| scan.scanner.is_complete())
        {
            if let Some(scan) = self.scans.pop_front() {
                self.process_scan(scan, generator)?;
                progress = true;
            }
        }

        let finished = self.final_scan_created && self.scans.is_empty();
        let forwarded = self.flush_unknown(finished, generator)?;
        if finished {
            debug!("Layer {} complete.", self.index);
            self.complete = true;
            progress = true;
        }

        Ok((progress, forwarded))
    }
}

/// Builds the chunk metadata of every chunk the manifest refers to.
fn collect_chunk_infos(
    matched: HashSet<Guid>,
    new_chunks: &HashMap<Guid, (u64, ShaHash)>,
    written_sizes: &HashMap<Guid, u64>,
    cloud: &CloudEnumeration,
) -> Result<Vec<ChunkInfoData>, BuildPatchError> {
    matched
        .into_iter()
        .map(|guid| -> Result<ChunkInfoData, BuildPatchError> {
            let (hash, sha_hash, file_size) = match new_chunks.get(&guid) {
                Some(&(hash, sha_hash)) => {
                    let file_size = written_sizes.get(&guid).copied().ok_or_else(|| {
                        BuildPatchError::ChunkWriteError(format!("Chunk {guid} was never written"))
                    })?;
                    (hash, sha_hash, file_size)
                }
                None => {
                    let missing = || {
                        BuildPatchError::ConsistencyError(format!(
                            "Matched chunk {guid} is not in the cloud index"
                        ))
                    };
                    (
                        *cloud.get_chunk_hashes().get(&guid).ok_or_else(missing)?,
                        *cloud.get_chunk_sha_hashes().get(&guid).ok_or_else(missing)?,
                        *cloud.get_chunk_file_sizes().get(&guid).ok_or_else(missing)?,
                    )
                }
            };
            Ok(ChunkInfoData {
                guid,
                hash,
                sha_hash,
                file_size,
                group_number: guid.group_number(),
            })
        })
        .collect()
}

fn contains_build_file(spans: &[FileSpan], path: &str) -> bool {
    let wanted = normalize_build_path(path);
    spans
        .iter()
        .any(|span| normalize_build_path(&span.filename) == wanted)
}

/// Chunks the build at the settings' root and writes its manifest.
///
/// New chunks are written to the cloud directory as they are minted and
/// the manifest is saved there once every byte of the build is accounted
/// for.
///
/// # Arguments
///
/// * `settings`: Paths, metadata and tuning for the run.
///
/// # Returns
///
/// A `Result` which is:
/// - `Ok(GenerationSummary)` once the manifest has been saved.
/// - `Err(BuildPatchError)` if the build is empty, the prerequisite is
///   missing, the cloud index cannot be read, a chunk cannot be written,
///   the coverage checks fail, or the run was cancelled.
pub fn generate_chunks_manifest_from_directory(
    settings: &GenerationSettings,
) -> Result<GenerationSummary, BuildPatchError> {
    let start_time = Instant::now();
    info!(
        "Generating manifest for {} into {}.",
        settings.root_directory.display(),
        settings.cloud_directory.display()
    );

    let ignore_list = match &settings.ignore_list_file {
        Some(path) => load_ignore_list(path)?,
        None => HashSet::new(),
    };
    let mut details = settings.details.clone();
    if let Some(path) = &settings.attribute_list_file {
        details.file_attributes = load_attribute_list(path)?;
    }

    let cloud = Arc::new(CloudEnumeration::new(
        &settings.cloud_directory,
        settings.data_age_threshold,
    )?);

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(settings.worker_threads)
        .build()
        .map_err(|e| BuildPatchError::ThreadPoolError(format!("Failed to create thread pool: {}", e)))?;

    let mut known_chunks: HashMap<u64, Vec<(Guid, ShaHash)>> = HashMap::new();
    for (guid, sha_hash) in cloud.get_chunk_sha_hashes() {
        if let Some(hash) = cloud.get_chunk_hashes().get(guid) {
            known_chunks.entry(*hash).or_default().push((*guid, *sha_hash));
        }
    }

    let mut generator = Generator {
        num_threads: pool.current_num_threads(),
        pool,
        cloud: Arc::clone(&cloud),
        counters: ScannerCounters::new(),
        scanner_backlog: settings.scanner_backlog,
        builder: ManifestBuilder::new(details),
        writer: ChunkWriter::new(settings.cloud_directory.clone(), ManifestVersion::LATEST),
        known_chunks,
        new_chunks: HashMap::new(),
        stats: GenerationStats::default(),
        cancel: &settings.cancel,
    };

    //Created up front so a cloud directory inside the build can be excluded.
    fs::create_dir_all(&settings.cloud_directory)?;
    let mut excluded_dirs = Vec::new();
    if let (Ok(root), Ok(cloud_dir)) = (
        settings.root_directory.canonicalize(),
        settings.cloud_directory.canonicalize(),
    ) && let Ok(nested) = cloud_dir.strip_prefix(&root)
    {
        //Walk paths are based on the root as given, not canonicalized.
        excluded_dirs.push(settings.root_directory.join(nested));
    }
    let mut streamer = BuildStreamer::new(BuildStreamerSettings {
        build_root: settings.root_directory.clone(),
        ignore_list,
        excluded_dirs,
    });

    let mut layers = vec![Layer::new(0)];
    let mut last_stats = Instant::now();

    loop {
        if generator.cancel.load(Ordering::Acquire) {
            warn!("Generation cancelled.");
            return Err(BuildPatchError::Cancelled);
        }

        let mut progress = false;

        let wanted = SCANNER_DATA_SIZE.saturating_sub(layers[0].input.len());
        if wanted > 0 && !streamer.is_end_of_data() {
            let data = streamer.dequeue_data(wanted, false);
            if !data.is_empty() {
                let read_block =
                    BlockStructure::from_block(generator.stats.bytes_read, data.len() as u64);
                layers[0].push_input(&data, &read_block);
                generator.stats.bytes_read += data.len() as u64;
                progress = true;
            }
        }

        let mut idx = 0;
        while idx < layers.len() {
            let upstream_done = match idx {
                0 => streamer.is_end_of_data(),
                _ => layers[idx - 1].complete,
            };
            let (stepped, forwarded) = layers[idx].step(upstream_done, &mut generator)?;
            progress |= stepped;

            if !forwarded.is_empty() {
                if layers.len() == idx + 1 {
                    debug!("Creating rescan layer {}.", idx + 1);
                    layers.push(Layer::new(idx + 1));
                }
                for batch in forwarded {
                    layers[idx + 1].push_input(&batch.data, &batch.build);
                }
            }
            idx += 1;
        }

        if layers.iter().all(|layer| layer.complete) {
            break;
        }

        if last_stats.elapsed() >= STATS_INTERVAL {
            generator.log_stats(&layers);
            last_stats = Instant::now();
        }

        if !progress {
            thread::sleep(IDLE_SLEEP);
        }
    }

    streamer.join()?;
    let file_spans = streamer.get_file_spans();
    let build_size = streamer.get_build_size();
    if build_size == 0 {
        return Err(BuildPatchError::NoBuildData(format!(
            "No data found in {}",
            settings.root_directory.display()
        )));
    }
    debug!(
        "Build has {} files, {} of them empty.",
        file_spans.len(),
        streamer.get_empty_files().len()
    );

    let details = &settings.details;
    if !details.prereq_path.is_empty() && !contains_build_file(file_spans, &details.prereq_path) {
        return Err(BuildPatchError::MissingPrerequisite(details.prereq_path.clone()));
    }
    if !details.launch_exe.is_empty() && !contains_build_file(file_spans, &details.launch_exe) {
        warn!("Launch executable {} is not part of the build.", details.launch_exe);
    }

    let Generator {
        mut builder,
        writer,
        new_chunks,
        stats,
        ..
    } = generator;

    let written_sizes = writer.finish()?;
    let matched = builder.matched_guids();
    let num_matched = matched.len();
    let chunk_infos = collect_chunk_infos(matched, &new_chunks, &written_sizes, &cloud)?;
    builder.finalize_data(file_spans, chunk_infos)?;

    let manifest_path = settings.manifest_path();
    builder.save_to_file(&manifest_path, settings.output_format)?;

    let summary = GenerationSummary {
        num_files: file_spans.len(),
        build_size,
        new_chunks: new_chunks.len(),
        reused_chunks: num_matched - new_chunks.len(),
        matched_bytes: stats.matched_bytes,
        hash_collisions: stats.hash_collisions,
        num_scanners: stats.scanners_created,
        num_layers: layers.len(),
        manifest_path,
        elapsed: start_time.elapsed(),
    };

    info!(
        "Generated {} in {:.2?}: {} files, {} of build data, {} new chunks, {} reused chunks, \
         {} matched by scanners, {} hash collisions, {} layers.",
        summary.manifest_path.display(),
        summary.elapsed,
        summary.num_files,
        human_readable_size(summary.build_size),
        summary.new_chunks,
        summary.reused_chunks,
        human_readable_size(summary.matched_bytes),
        summary.hash_collisions,
        summary.num_layers,
    );

    Ok(summary)
}
