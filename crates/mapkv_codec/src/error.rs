//! Error types for the codec crate.

use thiserror::Error;

/// Result type for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Errors that can occur during decoding, or when a value is too large
/// to decode again.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// Unexpected end of input.
    #[error("unexpected end of input")]
    UnexpectedEof,

    /// The type tag byte is not a known [`ValueType`](crate::ValueType).
    #[error("unknown type tag: {tag:#04x}")]
    UnknownTag {
        /// The offending tag byte.
        tag: u8,
    },

    /// A varint ran past ten bytes or overflowed 64 bits.
    #[error("malformed varint")]
    MalformedVarint,

    /// A decoded integer does not fit the tagged width.
    #[error("integer overflow")]
    IntegerOverflow,

    /// A boolean payload byte other than 0 or 1.
    #[error("invalid boolean byte: {byte:#04x}")]
    InvalidBool {
        /// The offending byte.
        byte: u8,
    },

    /// Invalid UTF-8 string.
    #[error("invalid UTF-8 string")]
    InvalidUtf8,

    /// A length exceeds the allowed maximum or the remaining input.
    #[error("length prefix too large: {len}")]
    LengthTooLarge {
        /// The declared length.
        len: u64,
    },

    /// Bytes were left over after decoding a complete value.
    #[error("trailing bytes after value: {remaining}")]
    TrailingBytes {
        /// Number of unconsumed bytes.
        remaining: usize,
    },
}
