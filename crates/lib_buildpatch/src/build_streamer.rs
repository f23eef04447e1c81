//! Presents a build directory as one continuous byte stream.
//!
//! A background thread walks the build root in a stable, name sorted
//! order and pushes file contents into a bounded channel. The generation
//! loop pulls bytes out with `dequeue_data` while the reader keeps going,
//! so reading overlaps with scanning. When the reader finishes, the list
//! of `FileSpan`s records where every file sits in the stream.

use std::{
    collections::HashSet,
    fs::{self, File},
    io::Read,
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender, bounded};
use sha1::{Digest, Sha1};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{
    chunk_data::sha1_digest,
    lib_error_handling::BuildPatchError,
    lib_structs::FileSpan,
    utils::{normalize_build_path, relative_path_string},
};

/// Size of the blocks the reader thread pushes into the channel.
const STREAM_BLOCK_SIZE: usize = 1024 * 1024;

/// Number of blocks buffered between the reader and the consumer.
const STREAM_QUEUE_DEPTH: usize = 64;

const DEQUEUE_WAIT: Duration = Duration::from_millis(100);

/// Inputs to a `BuildStreamer`.
///
/// # Fields
///
/// * `build_root`: Directory whose contents form the build.
/// * `ignore_list`: Normalized build relative paths to leave out.
/// * `excluded_dirs`: Absolute directories to skip entirely, such as a
///   cloud directory placed inside the build root.
#[derive(Clone, Debug, Default)]
pub struct BuildStreamerSettings {
    pub build_root: PathBuf,
    pub ignore_list: HashSet<String>,
    pub excluded_dirs: Vec<PathBuf>,
}

#[derive(Debug, Default)]
struct StreamOutput {
    file_spans: Vec<FileSpan>,
    empty_files: Vec<String>,
    build_size: u64,
}

/// Streams a build directory on a background thread.
pub struct BuildStreamer {
    receiver: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    pending_pos: usize,
    end_of_build: Arc<AtomicBool>,
    abort: Arc<AtomicBool>,
    handle: Option<JoinHandle<Result<StreamOutput, BuildPatchError>>>,
    output: StreamOutput,
}

impl BuildStreamer {
    pub fn new(settings: BuildStreamerSettings) -> Self {
        let (sender, receiver) = bounded(STREAM_QUEUE_DEPTH);
        let end_of_build = Arc::new(AtomicBool::new(false));
        let abort = Arc::new(AtomicBool::new(false));

        let thread_end = Arc::clone(&end_of_build);
        let thread_abort = Arc::clone(&abort);
        let handle = thread::spawn(move || {
            let result = read_build(&settings, &sender, &thread_abort);
            thread_end.store(true, Ordering::Release);
            result
        });

        Self {
            receiver,
            pending: Vec::new(),
            pending_pos: 0,
            end_of_build,
            abort,
            handle: Some(handle),
            output: StreamOutput::default(),
        }
    }

    /// Takes up to `max` bytes from the stream.
    ///
    /// When `wait` is set and nothing is buffered, blocks for a short
    /// while for the reader to produce data. An empty result does not
    /// mean the stream is over; check `is_end_of_data` for that.
    pub fn dequeue_data(&mut self, max: usize, wait: bool) -> Vec<u8> {
        let mut out = Vec::with_capacity(max.min(STREAM_BLOCK_SIZE * 4));

        while out.len() < max {
            if self.pending_pos < self.pending.len() {
                let take = (max - out.len()).min(self.pending.len() - self.pending_pos);
                out.extend_from_slice(&self.pending[self.pending_pos..self.pending_pos + take]);
                self.pending_pos += take;
                continue;
            }

            let next = if out.is_empty() && wait {
                match self.receiver.recv_timeout(DEQUEUE_WAIT) {
                    Ok(block) => Some(block),
                    Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
                }
            } else {
                self.receiver.try_recv().ok()
            };

            match next {
                Some(block) => {
                    self.pending = block;
                    self.pending_pos = 0;
                }
                None => break,
            }
        }

        out
    }

    /// True once the reader thread has finished walking the build.
    pub fn is_end_of_build(&self) -> bool {
        self.end_of_build.load(Ordering::Acquire)
    }

    /// True once the reader has finished and every byte was dequeued.
    pub fn is_end_of_data(&self) -> bool {
        self.is_end_of_build()
            && self.receiver.is_empty()
            && self.pending_pos >= self.pending.len()
    }

    /// Waits for the reader thread and collects its results.
    ///
    /// Must be called after `is_end_of_data` reports true. Reader errors,
    /// such as a file that vanished mid read, surface here.
    pub fn join(&mut self) -> Result<(), BuildPatchError> {
        if let Some(handle) = self.handle.take() {
            self.output = handle.join().map_err(|_| {
                BuildPatchError::InternalLibError("Build reader thread panicked".to_string())
            })??;
        }
        Ok(())
    }

    /// Every file of the build in stream order, including empty files.
    pub fn get_file_spans(&self) -> &[FileSpan] {
        &self.output.file_spans
    }

    pub fn get_empty_files(&self) -> &[String] {
        &self.output.empty_files
    }

    pub fn get_build_size(&self) -> u64 {
        self.output.build_size
    }
}

impl Drop for BuildStreamer {
    fn drop(&mut self) {
        //Dropping the receiver unblocks the reader if the queue is full.
        self.abort.store(true, Ordering::Release);
    }
}

fn is_excluded(path: &Path, settings: &BuildStreamerSettings) -> bool {
    settings
        .excluded_dirs
        .iter()
        .any(|dir| path.starts_with(dir))
}

#[cfg(unix)]
fn is_unix_executable(metadata: &fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_unix_executable(_metadata: &fs::Metadata) -> bool {
    false
}

fn read_build(
    settings: &BuildStreamerSettings,
    sender: &Sender<Vec<u8>>,
    abort: &AtomicBool,
) -> Result<StreamOutput, BuildPatchError> {
    let mut output = StreamOutput::default();
    let root = &settings.build_root;

    let walker = WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| !is_excluded(entry.path(), settings));

    for entry in walker {
        if abort.load(Ordering::Acquire) {
            return Err(BuildPatchError::Cancelled);
        }
        let entry = entry?;
        let file_type = entry.file_type();
        if file_type.is_dir() {
            continue;
        }

        let filename = relative_path_string(root, entry.path());
        if settings.ignore_list.contains(&normalize_build_path(&filename)) {
            debug!("Ignoring {filename}");
            continue;
        }

        if file_type.is_symlink() {
            let target = fs::read_link(entry.path())?;
            output.file_spans.push(FileSpan {
                filename,
                size: 0,
                start_idx: 0,
                is_unix_executable: false,
                symlink_target: target.to_string_lossy().replace('\\', "/"),
                sha_hash: sha1_digest(&[]),
            });
            continue;
        }

        if !file_type.is_file() {
            warn!("Skipping unsupported file type: {}", entry.path().display());
            continue;
        }

        let metadata = entry.metadata()?;
        let mut file = File::open(entry.path())?;
        let mut hasher = Sha1::new();
        let mut size = 0u64;

        loop {
            let mut block = vec![0u8; STREAM_BLOCK_SIZE];
            let read = read_block(&mut file, &mut block)?;
            if read == 0 {
                break;
            }
            block.truncate(read);
            hasher.update(&block);
            size += read as u64;
            if sender.send(block).is_err() {
                //Consumer is gone, nothing left to do.
                return Err(BuildPatchError::Cancelled);
            }
        }

        //Files without data occupy no place in the stream.
        let start_idx = if size == 0 {
            output.empty_files.push(filename.clone());
            0
        } else {
            output.build_size
        };
        output.file_spans.push(FileSpan {
            filename,
            size,
            start_idx,
            is_unix_executable: is_unix_executable(&metadata),
            symlink_target: String::new(),
            sha_hash: hasher.finalize().into(),
        });
        output.build_size += size;
    }

    debug!(
        "Build read complete: {} files, {} bytes.",
        output.file_spans.len(),
        output.build_size
    );
    Ok(output)
}

/// Fills `block` as far as the file allows.
fn read_block(file: &mut File, block: &mut [u8]) -> Result<usize, BuildPatchError> {
    let mut filled = 0;
    while filled < block.len() {
        let read = file.read(&mut block[filled..])?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(streamer: &mut BuildStreamer) -> Vec<u8> {
        let mut all = Vec::new();
        while !streamer.is_end_of_data() {
            all.extend(streamer.dequeue_data(3000, true));
        }
        all
    }

    #[test]
    fn test_streams_files_in_sorted_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("b_dir")).unwrap();
        fs::write(dir.path().join("c.bin"), vec![3u8; 5000]).unwrap();
        fs::write(dir.path().join("a.bin"), vec![1u8; 10]).unwrap();
        fs::write(dir.path().join("b_dir").join("inner.bin"), vec![2u8; 20]).unwrap();
        fs::write(dir.path().join("empty.txt"), b"").unwrap();

        let mut streamer = BuildStreamer::new(BuildStreamerSettings {
            build_root: dir.path().to_path_buf(),
            ..Default::default()
        });
        let data = drain(&mut streamer);
        streamer.join().unwrap();

        let names: Vec<_> = streamer
            .get_file_spans()
            .iter()
            .map(|span| span.filename.as_str())
            .collect();
        assert_eq!(names, vec!["a.bin", "b_dir/inner.bin", "c.bin", "empty.txt"]);
        assert_eq!(streamer.get_empty_files(), ["empty.txt".to_string()]);
        assert_eq!(streamer.get_build_size(), 5030);
        assert_eq!(data.len(), 5030);

        let spans = streamer.get_file_spans();
        assert_eq!(spans[1].start_idx, 10);
        assert_eq!(spans[2].start_idx, 30);
        assert_eq!(&data[30..], &vec![3u8; 5000][..]);
        assert_eq!(spans[2].sha_hash, sha1_digest(&vec![3u8; 5000]));
        assert_eq!(spans[3].size, 0);
        assert_eq!(spans[3].start_idx, 0);
    }

    #[test]
    fn test_ignore_list_and_exclusions() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("Cloud")).unwrap();
        fs::write(dir.path().join("Cloud").join("x.chunk"), vec![9u8; 10]).unwrap();
        fs::write(dir.path().join("Keep.bin"), vec![1u8; 10]).unwrap();
        fs::write(dir.path().join("Skip.log"), vec![2u8; 10]).unwrap();

        let mut streamer = BuildStreamer::new(BuildStreamerSettings {
            build_root: dir.path().to_path_buf(),
            ignore_list: HashSet::from(["skip.log".to_string()]),
            excluded_dirs: vec![dir.path().join("Cloud")],
        });
        let data = drain(&mut streamer);
        streamer.join().unwrap();

        assert_eq!(data, vec![1u8; 10]);
        assert_eq!(streamer.get_file_spans().len(), 1);
        assert_eq!(streamer.get_file_spans()[0].filename, "Keep.bin");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_and_executable_bits() {
        use std::os::unix::fs::{PermissionsExt, symlink};

        let dir = tempfile::tempdir().unwrap();
        let tool = dir.path().join("tool.sh");
        fs::write(&tool, b"#!/bin/sh\n").unwrap();
        fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        symlink("tool.sh", dir.path().join("zlink")).unwrap();

        let mut streamer = BuildStreamer::new(BuildStreamerSettings {
            build_root: dir.path().to_path_buf(),
            ..Default::default()
        });
        drain(&mut streamer);
        streamer.join().unwrap();

        let spans = streamer.get_file_spans();
        assert!(spans[0].is_unix_executable);
        assert_eq!(spans[1].symlink_target, "tool.sh");
        assert_eq!(spans[1].size, 0);
        assert_eq!(spans[1].start_idx, 0);
    }
}
