//! Declares the error handling types for the buildpatch library.
//!
//! This module defines the custom `BuildPatchError` enum, which
//! encapsulates all failure conditions that can occur while generating
//! manifests, reading chunk stores or running the maintenance tools. By
//! centralizing error definitions here, consumers of the library get one
//! consistent type to match on.
use std::io;

use thiserror::Error;

/// Represents all possible errors that can occur within the library.
///
/// Variants fall into two broad groups. Data conditions (bad headers,
/// hash mismatches, missing files) are returned so that callers such as
/// the verify tool can record them and continue. Consistency variants
/// signal that accumulated state no longer describes the build and the
/// current run must stop.
#[derive(Error, Debug)]
pub enum BuildPatchError {
    #[error("I/O Error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON Error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Directory walk failed: {0}")]
    WalkDir(#[from] walkdir::Error),

    #[error("File header is malformed. {0}")]
    InvalidHeaderError(String),

    #[error("Input list is malformed. {0}")]
    InvalidListError(String),

    #[error("Unsupported storage flags: {0}")]
    UnsupportedStorage(String),

    #[error("Failed to decode manifest: {0}")]
    ManifestDecodeError(String),

    #[error("Failed to encode manifest: {0}")]
    ManifestEncodeError(String),

    #[error("Verification failed for data: {0}")]
    HashMismatchError(String),

    #[error("Invalid GUID: {0}")]
    InvalidGuid(String),

    #[error("The build directory did not contain any data: {0}")]
    NoBuildData(String),

    #[error("Prerequisite file is not part of the build: {0}")]
    MissingPrerequisite(String),

    #[error("Failed to enumerate cloud directory: {0}")]
    CloudEnumerationError(String),

    #[error("Internal consistency check failed: {0}")]
    ConsistencyError(String),

    #[error("Chunk could not be written: {0}")]
    ChunkWriteError(String),

    #[error("Thread pool error: {0}")]
    ThreadPoolError(String),

    #[error("Operation cancelled.")]
    Cancelled,

    #[error("An internal logic error occurred: {0}")]
    InternalLibError(String),
}
