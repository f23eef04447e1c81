//! Background writer for newly minted chunks.
//!
//! The generation loop hands finished chunks to a dedicated thread over a
//! bounded channel and keeps scanning. The writer serializes each chunk,
//! writes it into the cloud directory and remembers the resulting file
//! size for the manifest. A failed write is retried a few times, after
//! which the whole run fails.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    thread::{self, JoinHandle},
    time::Duration,
};

use flume::{Receiver, Sender, bounded};
use tracing::{debug, error, warn};

use crate::{
    chunk_data::serialize_chunk,
    guid::Guid,
    lib_error_handling::BuildPatchError,
    lib_structs::ShaHash,
    manifest::ManifestVersion,
    utils::get_chunk_new_filename,
};

const WRITER_QUEUE_DEPTH: usize = 16;
const WRITE_ATTEMPTS: u32 = 5;
const RETRY_DELAY: Duration = Duration::from_secs(1);

/// A chunk waiting to be written.
struct QueuedChunk {
    guid: Guid,
    hash: u64,
    sha_hash: ShaHash,
    data: Vec<u8>,
}

/// Owns the writer thread and the producing end of its queue.
pub struct ChunkWriter {
    sender: Option<Sender<QueuedChunk>>,
    handle: Option<JoinHandle<Result<HashMap<Guid, u64>, BuildPatchError>>>,
}

impl ChunkWriter {
    /// Starts a writer that stores chunks under `cloud_dir`.
    pub fn new(cloud_dir: PathBuf, version: ManifestVersion) -> Self {
        let (sender, receiver) = bounded(WRITER_QUEUE_DEPTH);
        let handle = thread::spawn(move || write_chunks(&cloud_dir, version, receiver));
        Self {
            sender: Some(sender),
            handle: Some(handle),
        }
    }

    /// Queues a chunk for writing, blocking while the queue is full.
    ///
    /// Fails only if the writer thread has already stopped, which means an
    /// earlier chunk could not be written. The writer is joined and the
    /// error that stopped it is returned.
    pub fn queue_chunk(
        &mut self,
        guid: Guid,
        hash: u64,
        sha_hash: ShaHash,
        data: Vec<u8>,
    ) -> Result<(), BuildPatchError> {
        let queued = self
            .sender
            .as_ref()
            .ok_or_else(|| {
                BuildPatchError::InternalLibError("Chunk writer already finished".to_string())
            })?
            .send(QueuedChunk {
                guid,
                hash,
                sha_hash,
                data,
            });
        if queued.is_ok() {
            return Ok(());
        }

        self.sender.take();
        match self.handle.take().map(JoinHandle::join) {
            Some(Ok(Err(e))) => Err(e),
            Some(Err(_)) => Err(BuildPatchError::InternalLibError(
                "Chunk writer thread panicked".to_string(),
            )),
            _ => Err(BuildPatchError::ChunkWriteError(format!(
                "Writer stopped before chunk {guid} could be queued"
            ))),
        }
    }

    /// Waits for every queued chunk to be written.
    ///
    /// # Returns
    ///
    /// A `Result` containing the on disk file size of every written chunk,
    /// or the error that stopped the writer.
    pub fn finish(mut self) -> Result<HashMap<Guid, u64>, BuildPatchError> {
        self.sender.take();
        let handle = self.handle.take().ok_or_else(|| {
            BuildPatchError::InternalLibError("Chunk writer already finished".to_string())
        })?;
        handle.join().map_err(|_| {
            BuildPatchError::InternalLibError("Chunk writer thread panicked".to_string())
        })?
    }
}

impl Drop for ChunkWriter {
    fn drop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn write_chunks(
    cloud_dir: &std::path::Path,
    version: ManifestVersion,
    receiver: Receiver<QueuedChunk>,
) -> Result<HashMap<Guid, u64>, BuildPatchError> {
    let mut file_sizes = HashMap::new();

    while let Ok(chunk) = receiver.recv() {
        let bytes = serialize_chunk(chunk.guid, chunk.hash, chunk.sha_hash, &chunk.data)?;
        let path = get_chunk_new_filename(version, cloud_dir, &chunk.guid, chunk.hash);

        let mut attempt = 1;
        loop {
            let written = path
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::write(&path, &bytes));

            match written {
                Ok(()) => break,
                Err(e) if attempt < WRITE_ATTEMPTS => {
                    warn!(
                        "Failed to write chunk {} (attempt {attempt}): {e}. Retrying.",
                        path.display()
                    );
                    attempt += 1;
                    thread::sleep(RETRY_DELAY);
                }
                Err(e) => {
                    error!("Giving up on chunk {} after {attempt} attempts.", path.display());
                    return Err(BuildPatchError::ChunkWriteError(format!(
                        "{}: {e}",
                        path.display()
                    )));
                }
            }
        }

        debug!("Wrote chunk {}", path.display());
        file_sizes.insert(chunk.guid, bytes.len() as u64);
    }

    Ok(file_sizes)
}
