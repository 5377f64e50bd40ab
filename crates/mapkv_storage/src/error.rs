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

    /// Attempted to access bytes beyond the end of the region.
    #[error("access beyond end of region: offset {offset}, len {len}, size {size}")]
    OutOfBounds {
        /// The requested offset.
        offset: u64,
        /// The requested length.
        len: usize,
        /// The current region size.
        size: u64,
    },

    /// The region has no live mapping (a previous remap failed).
    #[error("region is not mapped")]
    Unmapped,

    /// A requested size cannot be mapped on this platform.
    #[error("invalid region size: {0}")]
    InvalidSize(u64),
}
