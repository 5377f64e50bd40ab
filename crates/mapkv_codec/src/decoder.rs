//! Tagged varint decoder.

use crate::error::{CodecError, CodecResult};
use crate::value::{Value, ValueType};

/// Maximum allowed byte/string length.
/// Bounds allocations driven by a corrupt length prefix.
pub const MAX_BYTES_LENGTH: u64 = 256 * 1024 * 1024;

/// Maximum allowed number of strings in a list.
pub const MAX_LIST_ELEMENTS: u64 = 16 * 1024 * 1024;

/// Decode exactly one value from `bytes`.
///
/// # Errors
///
/// Returns an error if the bytes are truncated, carry an unknown tag,
/// or contain trailing data after the value.
pub fn decode_value(bytes: &[u8]) -> CodecResult<Value> {
    let mut decoder = Decoder::new(bytes);
    let value = decoder.decode()?;
    if !decoder.is_empty() {
        return Err(CodecError::TrailingBytes {
            remaining: decoder.remaining().len(),
        });
    }
    Ok(value)
}

/// A cursor-based decoder over a byte slice.
///
/// Every read is bounds-checked; a truncated or corrupt buffer produces
/// a [`CodecError`] rather than a panic.
#[derive(Debug)]
pub struct Decoder<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Decoder<'a> {
    /// Create a new decoder for the given bytes.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Decode the next tagged value.
    #[allow(clippy::cast_possible_truncation)]
    pub fn decode(&mut self) -> CodecResult<Value> {
        let tag = ValueType::from_byte(self.read_byte()?)?;
        match tag {
            ValueType::Bool => match self.read_byte()? {
                0 => Ok(Value::Bool(false)),
                1 => Ok(Value::Bool(true)),
                byte => Err(CodecError::InvalidBool { byte }),
            },
            ValueType::I32 => {
                let n = self.read_zigzag()?;
                i32::try_from(n)
                    .map(Value::I32)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            ValueType::U32 => {
                let n = self.read_varint()?;
                u32::try_from(n)
                    .map(Value::U32)
                    .map_err(|_| CodecError::IntegerOverflow)
            }
            ValueType::I64 => self.read_zigzag().map(Value::I64),
            ValueType::U64 => self.read_varint().map(Value::U64),
            ValueType::F32 => {
                let b = self.read_raw(4)?;
                Ok(Value::F32(f32::from_bits(u32::from_le_bytes([
                    b[0], b[1], b[2], b[3],
                ]))))
            }
            ValueType::F64 => {
                let b = self.read_raw(8)?;
                Ok(Value::F64(f64::from_bits(u64::from_le_bytes([
                    b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7],
                ]))))
            }
            ValueType::Str => self.read_str().map(Value::Str),
            ValueType::Bytes => self.read_bytes().map(|b| Value::Bytes(b.to_vec())),
            ValueType::StrList => {
                let count = self.read_varint()?;
                // Each string takes at least one byte for its length prefix.
                if count > MAX_LIST_ELEMENTS || count > self.remaining().len() as u64 {
                    return Err(CodecError::LengthTooLarge { len: count });
                }
                let mut list = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    list.push(self.read_str()?);
                }
                Ok(Value::StrList(list))
            }
        }
    }

    /// Check if all bytes have been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// Get remaining bytes.
    pub fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos.min(self.data.len())..]
    }

    /// Current read position.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Read an unsigned LEB128 varint.
    pub fn read_varint(&mut self) -> CodecResult<u64> {
        let mut result = 0u64;
        let mut shift = 0u32;
        loop {
            let byte = self.read_byte()?;
            let low = u64::from(byte & 0x7f);
            if shift == 63 && low > 1 {
                return Err(CodecError::MalformedVarint);
            }
            result |= low << shift;
            if byte & 0x80 == 0 {
                return Ok(result);
            }
            shift += 7;
            if shift > 63 {
                return Err(CodecError::MalformedVarint);
            }
        }
    }

    /// Read a length-prefixed UTF-8 string.
    pub fn read_str(&mut self) -> CodecResult<String> {
        let bytes = self.read_bytes()?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidUtf8)
    }

    /// Read a length-prefixed byte buffer, borrowing from the input.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read_bytes(&mut self) -> CodecResult<&'a [u8]> {
        let len = self.read_varint()?;
        if len > MAX_BYTES_LENGTH || len > self.remaining().len() as u64 {
            return Err(CodecError::LengthTooLarge { len });
        }
        self.read_raw(len as usize)
    }

    #[allow(clippy::cast_possible_wrap)]
    fn read_zigzag(&mut self) -> CodecResult<i64> {
        let n = self.read_varint()?;
        Ok(((n >> 1) as i64) ^ -((n & 1) as i64))
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self.data.get(self.pos).ok_or(CodecError::UnexpectedEof)?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_raw(&mut self, len: usize) -> CodecResult<&'a [u8]> {
        let end = self.pos.checked_add(len).ok_or(CodecError::UnexpectedEof)?;
        let bytes = self.data.get(self.pos..end).ok_or(CodecError::UnexpectedEof)?;
        self.pos = end;
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::encode_value;

    #[test]
    fn decode_empty_input() {
        assert_eq!(decode_value(&[]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn decode_unknown_tag() {
        assert_eq!(
            decode_value(&[0xee, 0]),
            Err(CodecError::UnknownTag { tag: 0xee })
        );
    }

    #[test]
    fn decode_truncated_string() {
        let mut bytes = encode_value(&Value::from("hello"));
        bytes.truncate(4);
        assert!(matches!(
            decode_value(&bytes),
            Err(CodecError::LengthTooLarge { len: 5 })
        ));
    }

    #[test]
    fn decode_truncated_float() {
        let bytes = encode_value(&Value::F64(1.5));
        assert_eq!(decode_value(&bytes[..5]), Err(CodecError::UnexpectedEof));
    }

    #[test]
    fn decode_rejects_overlong_varint() {
        let mut bytes = vec![5u8];
        bytes.extend_from_slice(&[0xff; 10]);
        bytes.push(0x01);
        assert_eq!(decode_value(&bytes), Err(CodecError::MalformedVarint));
    }

    #[test]
    fn decode_rejects_i32_overflow() {
        let bytes = encode_value(&Value::I64(i64::from(i32::MAX) + 1));
        let mut retagged = bytes.clone();
        retagged[0] = ValueType::I32.as_byte();
        assert_eq!(decode_value(&retagged), Err(CodecError::IntegerOverflow));
    }

    #[test]
    fn decode_rejects_trailing_bytes() {
        let mut bytes = encode_value(&Value::Bool(true));
        bytes.push(0);
        assert_eq!(
            decode_value(&bytes),
            Err(CodecError::TrailingBytes { remaining: 1 })
        );
    }

    #[test]
    fn decode_rejects_invalid_utf8() {
        let bytes = vec![ValueType::Str.as_byte(), 2, 0xc3, 0x28];
        assert_eq!(decode_value(&bytes), Err(CodecError::InvalidUtf8));
    }

    #[test]
    fn decoder_reads_sequential_values() {
        let mut buf = encode_value(&Value::U32(300));
        buf.extend(encode_value(&Value::from("k")));
        let mut decoder = Decoder::new(&buf);
        assert_eq!(decoder.decode().unwrap(), Value::U32(300));
        assert_eq!(decoder.decode().unwrap(), Value::from("k"));
        assert!(decoder.is_empty());
    }
}
