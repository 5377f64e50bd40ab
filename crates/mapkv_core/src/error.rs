//! Error types for MapKV core.

use std::io;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in MapKV core operations.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Mapped region error.
    #[error("storage error: {0}")]
    Storage(#[from] mapkv_storage::StorageError),

    /// Value codec error.
    #[error("codec error: {0}")]
    Codec(#[from] mapkv_codec::CodecError),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Header, content or record failed validation.
    #[error("corrupt data: {message}")]
    CorruptData {
        /// Description of the corruption.
        message: String,
    },

    /// Bytes are not a MapKV file or record.
    #[error("invalid format: {message}")]
    InvalidFormat {
        /// Description of the problem.
        message: String,
    },

    /// Checksum mismatch detected.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Expected checksum.
        expected: u32,
        /// Actual checksum.
        actual: u32,
    },

    /// A bounded wait on the process lock expired.
    #[error("timed out waiting for {kind} lock on {id}")]
    LockTimeout {
        /// Store identifier.
        id: String,
        /// `"shared"` or `"exclusive"`.
        kind: &'static str,
    },

    /// No backing file (or backup) exists for the identifier.
    #[error("storage not found: {id}")]
    StorageNotFound {
        /// Store identifier.
        id: String,
    },

    /// The supplied crypt key does not match the store.
    #[error("crypt key does not match store {id}")]
    InvalidCryptKey {
        /// Store identifier.
        id: String,
    },

    /// The store's encryption state differs from what the caller asked for.
    #[error("store {id} is {} but was opened {}", if *.encrypted { "encrypted" } else { "plain" }, if *.encrypted { "without a crypt key" } else { "with a crypt key" })]
    CryptStateMismatch {
        /// Store identifier.
        id: String,
        /// Whether the file on disk is encrypted.
        encrypted: bool,
    },

    /// Encryption setup failed.
    #[error("encryption failed: {message}")]
    EncryptionFailed {
        /// Description of the failure.
        message: String,
    },

    /// Caller passed an unusable argument.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// Description of the problem.
        message: String,
    },

    /// A write was attempted on a read-only store.
    #[error("store {id} is read-only")]
    ReadOnly {
        /// Store identifier.
        id: String,
    },

    /// The store was closed or removed.
    #[error("store {id} is closed")]
    StoreClosed {
        /// Store identifier.
        id: String,
    },
}

impl CoreError {
    /// Creates a corrupt data error.
    pub fn corrupt_data(message: impl Into<String>) -> Self {
        Self::CorruptData {
            message: message.into(),
        }
    }

    /// Creates an invalid format error.
    pub fn invalid_format(message: impl Into<String>) -> Self {
        Self::InvalidFormat {
            message: message.into(),
        }
    }

    /// Creates an invalid argument error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates an encryption failed error.
    pub fn encryption_failed(message: impl Into<String>) -> Self {
        Self::EncryptionFailed {
            message: message.into(),
        }
    }

    /// Creates a storage not found error.
    pub fn storage_not_found(id: impl Into<String>) -> Self {
        Self::StorageNotFound { id: id.into() }
    }

    /// Returns `true` if the error means the stored bytes cannot be trusted.
    #[must_use]
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            Self::CorruptData { .. } | Self::InvalidFormat { .. } | Self::ChecksumMismatch { .. }
        )
    }

    /// Returns `true` for lock-timeout errors.
    #[must_use]
    pub fn is_lock_timeout(&self) -> bool {
        matches!(self, Self::LockTimeout { .. })
    }
}
