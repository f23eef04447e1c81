//! Finds known chunks inside a buffer of build data.
//!
//! A scanner slides a chunk sized rolling hash window over its buffer and
//! looks every window hash up in the cloud inventory. A hash hit is
//! confirmed with SHA-1 before it counts as a match. Once a match is
//! accepted the window jumps past the whole matched chunk, which keeps
//! scanning close to linear on data that is mostly known.
//!
//! Scans run on a rayon pool. Each `DataScanner` owns the result channel
//! of one scan task and can be polled or waited on.

use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use flume::{Receiver, TryRecvError, bounded};
use tracing::debug;

use crate::{
    chunk_data::{CHUNK_DATA_SIZE, sha1_digest},
    cloud_enumeration::CloudEnumeration,
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::ChunkMatch,
    rolling_hash::RollingHash,
};

/// How many window positions are scanned between abort checks.
const ABORT_CHECK_INTERVAL: usize = 64 * 1024;

/// Live scanner counts, shared between the orchestrator and its scanners.
///
/// `incomplete` counts scanners created but not finished, `running`
/// counts those currently executing on the pool. The difference is the
/// backlog waiting for a worker.
#[derive(Debug, Default)]
pub struct ScannerCounters {
    incomplete: AtomicUsize,
    running: AtomicUsize,
}

impl ScannerCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn num_incomplete(&self) -> usize {
        self.incomplete.load(Ordering::Acquire)
    }

    pub fn num_running(&self) -> usize {
        self.running.load(Ordering::Acquire)
    }
}

/// Output of one scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanResult {
    /// Accepted matches, ascending and non overlapping.
    pub matches: Vec<ChunkMatch>,
    /// Number of hash hits that failed SHA-1 confirmation.
    pub hash_collisions: u64,
}

/// Handle to one asynchronous scan.
pub struct DataScanner {
    receiver: Receiver<ScanResult>,
    result: Option<ScanResult>,
    abort: Arc<AtomicBool>,
}

impl DataScanner {
    /// Starts scanning `data` on `pool`.
    ///
    /// # Arguments
    ///
    /// * `data`: Build bytes to scan. Shared with the caller, which keeps
    ///   it to collect unmatched bytes once the scan is done.
    /// * `cloud`: Read only chunk index to match against.
    /// * `counters`: Shared live scanner counters.
    /// * `pool`: Thread pool the scan task is spawned on.
    pub fn new(
        data: Arc<Vec<u8>>,
        cloud: Arc<CloudEnumeration>,
        counters: Arc<ScannerCounters>,
        pool: &rayon::ThreadPool,
    ) -> Self {
        let (sender, receiver) = bounded(1);
        let abort = Arc::new(AtomicBool::new(false));
        let task_abort = Arc::clone(&abort);

        counters.incomplete.fetch_add(1, Ordering::AcqRel);
        pool.spawn(move || {
            counters.running.fetch_add(1, Ordering::AcqRel);
            let result = find_chunk_data_matches(&data, &cloud, &task_abort);
            counters.running.fetch_sub(1, Ordering::AcqRel);
            counters.incomplete.fetch_sub(1, Ordering::AcqRel);
            //The receiver may already be gone if the scanner was dropped.
            let _ = sender.send(result);
        });

        Self {
            receiver,
            result: None,
            abort,
        }
    }

    /// Non blocking check for scan completion.
    pub fn is_complete(&mut self) -> bool {
        if self.result.is_some() {
            return true;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.result = Some(result);
                true
            }
            Err(TryRecvError::Empty) => false,
            //A vanished task is complete too; get_result reports the failure.
            Err(TryRecvError::Disconnected) => true,
        }
    }

    /// Blocks until the scan is done and takes its result.
    pub fn get_result_when_complete(&mut self) -> Result<ScanResult, BuildPatchError> {
        if let Some(result) = self.result.take() {
            return Ok(result);
        }
        self.receiver.recv().map_err(|_| {
            BuildPatchError::InternalLibError("Scanner task ended without a result".to_string())
        })
    }
}

impl Drop for DataScanner {
    fn drop(&mut self) {
        if self.result.is_none() {
            self.abort.store(true, Ordering::Release);
            //Wait for the task so its buffer is released; the result is discarded.
            let _ = self.receiver.recv();
        }
    }
}

/// Looks up the chunk whose content equals `window`, if any.
///
/// Returns the matching GUID together with the number of GUIDs that share
/// the hash but not the SHA-1.
fn find_chunk_for_window(
    window: &[u8],
    candidates: &std::collections::HashSet<Guid>,
    cloud: &CloudEnumeration,
) -> (Option<Guid>, u64) {
    let window_sha = sha1_digest(window);
    let shas = cloud.get_chunk_sha_hashes();
    let mut found = None;
    let mut collisions = 0;

    for guid in candidates {
        if shas.get(guid) == Some(&window_sha) {
            if found.is_none() {
                found = Some(*guid);
            }
        } else {
            collisions += 1;
        }
    }

    (found, collisions)
}

/// Scans `data` for windows that equal a known chunk.
pub fn find_chunk_data_matches(
    data: &[u8],
    cloud: &CloudEnumeration,
    abort: &AtomicBool,
) -> ScanResult {
    let mut result = ScanResult::default();
    let window_size = CHUNK_DATA_SIZE;
    if data.len() < window_size || cloud.is_empty() {
        return result;
    }

    let inventory = cloud.get_chunk_inventory();
    let mut hasher = RollingHash::new(window_size);
    hasher.consume_bytes(&data[..window_size]);

    let mut pos = 0usize;

    loop {
        if pos % ABORT_CHECK_INTERVAL == 0 && abort.load(Ordering::Acquire) {
            debug!("Scanner aborted at offset {pos}.");
            return result;
        }

        let mut matched = None;
        if let Some(candidates) = inventory.get(&hasher.get_window_hash()) {
            let (found, collisions) =
                find_chunk_for_window(&data[pos..pos + window_size], candidates, cloud);
            result.hash_collisions += collisions;
            matched = found;
        }

        match matched {
            Some(chunk_guid) => {
                result.matches.push(ChunkMatch {
                    data_offset: pos as u64,
                    chunk_guid,
                });

                //Skip the whole matched chunk and refill the window after it.
                let next = pos + window_size;
                if next + window_size > data.len() {
                    break;
                }
                hasher.clear();
                hasher.consume_bytes(&data[next..next + window_size]);
                pos = next;
            }
            _ => {
                if pos + window_size >= data.len() {
                    break;
                }
                hasher.roll_forward(data[pos + window_size]);
                pos += 1;
            }
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{lib_structs::ChunkInfoData, manifest::Manifest};

    fn pseudo_random(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed | 1;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 32) as u8
            })
            .collect()
    }

    fn cloud_with(chunks: &[(&[u8], Guid)]) -> CloudEnumeration {
        let mut manifest = Manifest::new();
        manifest.chunk_list = chunks
            .iter()
            .map(|(data, guid)| ChunkInfoData {
                guid: *guid,
                hash: RollingHash::get_hash_for_data_set(data),
                sha_hash: sha1_digest(data),
                file_size: 1,
                group_number: guid.group_number(),
            })
            .collect();
        let mut cloud = CloudEnumeration::default();
        cloud.add_manifest(&manifest);
        cloud
    }

    #[test]
    fn test_finds_chunk_at_unaligned_offset() {
        let known = pseudo_random(CHUNK_DATA_SIZE, 1);
        let guid = Guid::new(1, 2, 3, 4);
        let cloud = cloud_with(&[(&known, guid)]);

        let mut data = pseudo_random(777, 2);
        data.extend_from_slice(&known);
        data.extend(pseudo_random(100, 3));

        let result = find_chunk_data_matches(&data, &cloud, &AtomicBool::new(false));
        assert_eq!(
            result.matches,
            vec![ChunkMatch { data_offset: 777, chunk_guid: guid }]
        );
        assert_eq!(result.hash_collisions, 0);
    }

    #[test]
    fn test_consecutive_matches_do_not_overlap() {
        let known = vec![0xABu8; CHUNK_DATA_SIZE];
        let guid = Guid::new(5, 5, 5, 5);
        let cloud = cloud_with(&[(&known, guid)]);

        //Two and a half chunks of the same byte match at 0 and CHUNK only.
        let data = vec![0xABu8; CHUNK_DATA_SIZE * 5 / 2];
        let result = find_chunk_data_matches(&data, &cloud, &AtomicBool::new(false));
        let offsets: Vec<u64> = result.matches.iter().map(|m| m.data_offset).collect();
        assert_eq!(offsets, vec![0, CHUNK_DATA_SIZE as u64]);
    }

    #[test]
    fn test_adjacent_distinct_chunks_both_found() {
        let first = pseudo_random(CHUNK_DATA_SIZE, 21);
        let second = pseudo_random(CHUNK_DATA_SIZE, 22);
        let cloud = cloud_with(&[(&first, Guid::new(1, 0, 0, 1)), (&second, Guid::new(1, 0, 0, 2))]);

        let mut data = pseudo_random(50, 23);
        data.extend_from_slice(&first);
        data.extend_from_slice(&second);
        let result = find_chunk_data_matches(&data, &cloud, &AtomicBool::new(false));
        assert_eq!(
            result.matches,
            vec![
                ChunkMatch { data_offset: 50, chunk_guid: Guid::new(1, 0, 0, 1) },
                ChunkMatch { data_offset: 50 + CHUNK_DATA_SIZE as u64, chunk_guid: Guid::new(1, 0, 0, 2) },
            ]
        );
    }

    #[test]
    fn test_sha_mismatch_counts_collision() {
        let known = pseudo_random(CHUNK_DATA_SIZE, 9);
        let guid = Guid::new(7, 7, 7, 7);
        let mut manifest = Manifest::new();
        manifest.chunk_list.push(ChunkInfoData {
            guid,
            hash: RollingHash::get_hash_for_data_set(&known),
            sha_hash: [0xEE; 20],
            file_size: 1,
            group_number: 0,
        });
        let mut cloud = CloudEnumeration::default();
        cloud.add_manifest(&manifest);

        let result = find_chunk_data_matches(&known, &cloud, &AtomicBool::new(false));
        assert!(result.matches.is_empty());
        assert_eq!(result.hash_collisions, 1);
    }

    #[test]
    fn test_short_buffer_has_no_matches() {
        let known = pseudo_random(CHUNK_DATA_SIZE, 4);
        let cloud = cloud_with(&[(&known, Guid::new(1, 1, 1, 1))]);
        let result = find_chunk_data_matches(&known[..1000], &cloud, &AtomicBool::new(false));
        assert_eq!(result, ScanResult::default());
    }

    #[test]
    fn test_async_scanner_reports_result() {
        let known = pseudo_random(CHUNK_DATA_SIZE, 11);
        let guid = Guid::new(8, 8, 8, 8);
        let cloud = Arc::new(cloud_with(&[(&known, guid)]));
        let pool = rayon::ThreadPoolBuilder::new().num_threads(2).build().unwrap();
        let counters = ScannerCounters::new();

        let mut scanner = DataScanner::new(
            Arc::new(known.clone()),
            Arc::clone(&cloud),
            Arc::clone(&counters),
            &pool,
        );
        let result = scanner.get_result_when_complete().unwrap();
        assert_eq!(result.matches.len(), 1);
        assert_eq!(counters.num_incomplete(), 0);
        assert_eq!(counters.num_running(), 0);
    }
}
