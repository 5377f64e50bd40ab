//! # MapKV Codec
//!
//! Type-tagged, variable-length binary encoding for MapKV values.
//!
//! Every encoded value starts with a one-byte [`ValueType`] tag. Integers
//! are LEB128 varints (signed widths zig-zag mapped first), floats keep
//! their exact IEEE bits, and strings / byte buffers are length-prefixed.
//! Encoding is deterministic: equal values always produce equal bytes,
//! which the store relies on for compare-before-set.
//!
//! ## Usage
//!
//! ```
//! use mapkv_codec::{decode_value, encode_value, Value};
//!
//! let value = Value::I32(i32::MIN);
//! let bytes = encode_value(&value);
//! assert_eq!(decode_value(&bytes).unwrap(), value);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod encoder;
mod error;
mod value;

pub use decoder::{decode_value, Decoder, MAX_BYTES_LENGTH, MAX_LIST_ELEMENTS};
pub use encoder::{check_encodable, check_length, encode_value, encoded_len, prefixed_len, varint_len, Encoder};
pub use error::{CodecError, CodecResult};
pub use value::{FromValue, Value, ValueType};
