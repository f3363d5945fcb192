//! Error types for storage operations.

use std::io;
use thiserror::Error;

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// An I/O error occurred.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The requested index does not exist in this store.
    #[error("no such index: {index} (store has {count} indices)")]
    NoSuchIndex {
        /// The requested index.
        index: usize,
        /// Number of indices the store was created with.
        count: usize,
    },

    /// Encoded image bytes are corrupted.
    #[error("image corrupted: {0}")]
    Corrupted(String),

    /// An image was loaded into a store with a different shape.
    #[error("image has {actual} indices, store expects {expected}")]
    ShapeMismatch {
        /// Index count of the store.
        expected: usize,
        /// Index count of the image.
        actual: usize,
    },
}

impl StorageError {
    /// Creates a corruption error.
    pub fn corrupted(message: impl Into<String>) -> Self {
        Self::Corrupted(message.into())
    }
}
