//! Error types for the int-to-int B-tree

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StorageError>;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// On-disk structure is inconsistent; the tree must be rebuilt by the caller.
    #[error("Corrupted file {}: {reason}", path.display())]
    CorruptedFile { path: PathBuf, reason: String },

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Only raised when `TreeConfig::sanity_check` is enabled.
    #[error("Sanity check failed: {0}")]
    SanityCheck(String),
}

impl StorageError {
    pub(crate) fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::CorruptedFile {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for errors that signal a damaged file rather than an I/O or usage problem.
    pub fn is_corruption(&self) -> bool {
        matches!(self, StorageError::CorruptedFile { .. })
    }
}
