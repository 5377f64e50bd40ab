//! Tagged varint encoder.

use crate::decoder::{MAX_BYTES_LENGTH, MAX_LIST_ELEMENTS};
use crate::error::{CodecError, CodecResult};
use crate::value::Value;

/// Encode a value to its tagged byte form.
///
/// Layout: one tag byte followed by the payload:
/// - integers are LEB128 varints, signed ones zig-zag mapped first
/// - floats are their IEEE bits, little-endian
/// - strings and byte buffers are a varint length then the raw bytes
/// - string lists are a varint count then each string
pub fn encode_value(value: &Value) -> Vec<u8> {
    let mut encoder = Encoder::with_capacity(encoded_len(value));
    encoder.encode(value);
    encoder.into_bytes()
}

/// Rejects values the decoder would refuse to read back.
///
/// # Errors
///
/// Returns [`CodecError::LengthTooLarge`] if a string or buffer is longer
/// than [`MAX_BYTES_LENGTH`] or a list holds more than
/// [`MAX_LIST_ELEMENTS`] strings.
pub fn check_encodable(value: &Value) -> CodecResult<()> {
    match value {
        Value::Str(s) => check_length(s.len()),
        Value::Bytes(b) => check_length(b.len()),
        Value::StrList(list) => {
            let count = list.len() as u64;
            if count > MAX_LIST_ELEMENTS {
                return Err(CodecError::LengthTooLarge { len: count });
            }
            list.iter().try_for_each(|s| check_length(s.len()))
        }
        _ => Ok(()),
    }
}

/// Rejects a length-prefixed buffer of `len` bytes above [`MAX_BYTES_LENGTH`].
///
/// # Errors
///
/// Returns [`CodecError::LengthTooLarge`] past the limit.
pub fn check_length(len: usize) -> CodecResult<()> {
    let len = len as u64;
    if len > MAX_BYTES_LENGTH {
        return Err(CodecError::LengthTooLarge { len });
    }
    Ok(())
}

/// Returns the exact number of bytes [`encode_value`] produces.
#[must_use]
pub fn encoded_len(value: &Value) -> usize {
    1 + match value {
        Value::Bool(_) => 1,
        Value::I32(n) => varint_len(zigzag(i64::from(*n))),
        Value::U32(n) => varint_len(u64::from(*n)),
        Value::I64(n) => varint_len(zigzag(*n)),
        Value::U64(n) => varint_len(*n),
        Value::F32(_) => 4,
        Value::F64(_) => 8,
        Value::Str(s) => prefixed_len(s.len()),
        Value::Bytes(b) => prefixed_len(b.len()),
        Value::StrList(list) => {
            varint_len(list.len() as u64) + list.iter().map(|s| prefixed_len(s.len())).sum::<usize>()
        }
    }
}

/// Number of bytes a varint takes for `n`.
#[must_use]
pub const fn varint_len(mut n: u64) -> usize {
    let mut len = 1;
    while n >= 0x80 {
        n >>= 7;
        len += 1;
    }
    len
}

/// Bytes taken by a length-prefixed buffer of `len` bytes.
#[must_use]
pub const fn prefixed_len(len: usize) -> usize {
    varint_len(len as u64) + len
}

#[inline]
#[allow(clippy::cast_sign_loss)]
pub(crate) const fn zigzag(n: i64) -> u64 {
    ((n << 1) ^ (n >> 63)) as u64
}

/// A tagged value encoder writing into a growable buffer.
///
/// The low-level writers are public so that record framing in the core
/// crate can reuse the same varint and string forms for keys.
#[derive(Debug, Default)]
pub struct Encoder {
    buffer: Vec<u8>,
}

impl Encoder {
    /// Create a new encoder.
    pub fn new() -> Self {
        Self { buffer: Vec::new() }
    }

    /// Create a new encoder with the specified capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: Vec::with_capacity(capacity),
        }
    }

    /// Encode a tagged value.
    pub fn encode(&mut self, value: &Value) {
        self.buffer.push(value.value_type().as_byte());
        match value {
            Value::Bool(b) => self.buffer.push(u8::from(*b)),
            Value::I32(n) => self.write_varint(zigzag(i64::from(*n))),
            Value::U32(n) => self.write_varint(u64::from(*n)),
            Value::I64(n) => self.write_varint(zigzag(*n)),
            Value::U64(n) => self.write_varint(*n),
            Value::F32(f) => self.buffer.extend_from_slice(&f.to_bits().to_le_bytes()),
            Value::F64(f) => self.buffer.extend_from_slice(&f.to_bits().to_le_bytes()),
            Value::Str(s) => self.write_str(s),
            Value::Bytes(b) => self.write_bytes(b),
            Value::StrList(list) => {
                self.write_varint(list.len() as u64);
                for s in list {
                    self.write_str(s);
                }
            }
        }
    }

    /// Write an unsigned LEB128 varint.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write_varint(&mut self, mut n: u64) {
        while n >= 0x80 {
            self.buffer.push((n as u8) | 0x80);
            n >>= 7;
        }
        self.buffer.push(n as u8);
    }

    /// Write a length-prefixed UTF-8 string.
    pub fn write_str(&mut self, s: &str) {
        self.write_bytes(s.as_bytes());
    }

    /// Write a length-prefixed byte buffer.
    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.write_varint(bytes.len() as u64);
        self.buffer.extend_from_slice(bytes);
    }

    /// Consume this encoder and return the encoded bytes.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buffer
    }

    /// Get a reference to the encoded bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_bool() {
        assert_eq!(encode_value(&Value::Bool(false)), vec![1, 0]);
        assert_eq!(encode_value(&Value::Bool(true)), vec![1, 1]);
    }

    #[test]
    fn encode_small_integers() {
        assert_eq!(encode_value(&Value::U32(0)), vec![3, 0x00]);
        assert_eq!(encode_value(&Value::U32(127)), vec![3, 0x7f]);
        assert_eq!(encode_value(&Value::U32(128)), vec![3, 0x80, 0x01]);
    }

    #[test]
    fn zigzag_keeps_small_negatives_short() {
        assert_eq!(encode_value(&Value::I32(-1)), vec![2, 0x01]);
        assert_eq!(encode_value(&Value::I32(1)), vec![2, 0x02]);
        assert_eq!(encode_value(&Value::I64(-64)), vec![4, 0x7f]);
    }

    #[test]
    fn u64_max_takes_ten_bytes() {
        let bytes = encode_value(&Value::U64(u64::MAX));
        assert_eq!(bytes.len(), 11);
        assert_eq!(*bytes.last().unwrap(), 0x01);
    }

    #[test]
    fn encode_string_is_length_prefixed() {
        assert_eq!(
            encode_value(&Value::from("hi")),
            vec![8, 2, b'h', b'i']
        );
    }

    #[test]
    fn encoded_len_matches_output() {
        let samples = [
            Value::Bool(true),
            Value::I32(i32::MIN),
            Value::U32(u32::MAX),
            Value::I64(i64::MIN),
            Value::U64(u64::MAX),
            Value::F32(f32::MAX),
            Value::F64(f64::MIN_POSITIVE),
            Value::Str("x".repeat(300)),
            Value::Bytes(vec![0; 129]),
            Value::StrList(vec!["a".into(), String::new(), "ccc".into()]),
        ];
        for value in &samples {
            assert_eq!(encoded_len(value), encode_value(value).len(), "{value:?}");
        }
    }

    #[test]
    fn length_limit_matches_decoder() {
        let limit = usize::try_from(MAX_BYTES_LENGTH).unwrap();
        assert!(check_length(limit).is_ok());
        assert_eq!(
            check_length(limit + 1),
            Err(CodecError::LengthTooLarge { len: MAX_BYTES_LENGTH + 1 })
        );

        assert!(check_encodable(&Value::Bytes(vec![0; limit])).is_ok());
        assert!(check_encodable(&Value::Bytes(vec![0; limit + 1])).is_err());
        assert!(check_encodable(&Value::U64(u64::MAX)).is_ok());
        assert!(check_encodable(&Value::StrList(vec!["ok".into()])).is_ok());
    }

    #[test]
    fn varint_lengths() {
        assert_eq!(varint_len(0), 1);
        assert_eq!(varint_len(127), 1);
        assert_eq!(varint_len(128), 2);
        assert_eq!(varint_len(u64::MAX), 10);
    }
}
