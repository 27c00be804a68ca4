use std::path::PathBuf;

use thiserror::Error;
use zip::result::ZipError;

use crate::core::client::storage::StorageError;

#[derive(Error, Debug)]
pub enum ZipIndexError {
    #[error("Member not found in archive index: {0}")]
    EntryNotFound(String),

    /// The recorded offset or size does not match the archive
    #[error("Index entry {name} is corrupt: {reason}")]
    IndexCorrupt { name: String, reason: String },

    #[error("Member {name} uses {method} compression, only deflate and stored members can be indexed")]
    UnsupportedCompression { name: String, method: String },

    #[error("No local file header for {name} at offset {offset}")]
    InvalidLocalHeader { name: String, offset: u64 },

    #[error("Zip error: {0}")]
    ZipError(#[from] ZipError),

    #[error("Index encoding error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    /// Pushing a directory without any entry
    #[error("Refusing to push empty artifact directory {0}")]
    EmptyArtifact(PathBuf),

    #[error("Artifact directory does not exist: {0}")]
    MissingDirectory(PathBuf),

    #[error("Archive member escapes the target directory: {0}")]
    UnsafePath(String),

    #[error("Storage error: {0}")]
    StorageError(#[from] StorageError),

    #[error("Index error: {0}")]
    IndexError(#[from] ZipIndexError),

    #[error("Zip error: {0}")]
    ZipError(#[from] ZipError),

    #[error("Failed to walk artifact directory: {0}")]
    WalkError(#[from] walkdir::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Archive task failed: {0}")]
    TaskFailed(String),
}
