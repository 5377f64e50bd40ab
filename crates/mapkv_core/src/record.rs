//! Log record framing.
//!
//! ```text
//! len:u32 | flags:u8 | [expire_at:u64] | key (varint len + utf8) | value | crc32:u32
//! ```
//!
//! `len` counts the whole record, itself and the CRC included. The value is
//! a tagged `mapkv_codec` encoding and is absent for tombstones. The CRC
//! covers every byte before it and is computed over the plaintext.

use crate::error::{CoreError, CoreResult};
use mapkv_codec::{decode_value, prefixed_len, Decoder, Encoder, Value};

/// Flags stored in each record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecordFlags(u8);

impl RecordFlags {
    /// No flags set.
    pub const NONE: Self = Self(0);
    /// Record deletes its key.
    pub const TOMBSTONE: Self = Self(0x01);
    /// Record carries an absolute expiry time.
    pub const HAS_EXPIRY: Self = Self(0x02);

    const KNOWN: u8 = 0x03;

    /// Returns the raw byte value.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        self.0
    }

    /// Checks if the tombstone flag is set.
    #[must_use]
    pub const fn is_tombstone(self) -> bool {
        self.0 & 0x01 != 0
    }

    /// Checks if the expiry flag is set.
    #[must_use]
    pub const fn has_expiry(self) -> bool {
        self.0 & 0x02 != 0
    }
}

/// A decoded log record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Key the record applies to.
    pub key: String,
    /// Record flags.
    pub flags: RecordFlags,
    /// Absolute expiry in seconds since the Unix epoch.
    pub expire_at: Option<u64>,
    /// Encoded value bytes (empty for tombstones).
    pub value: Vec<u8>,
}

impl Record {
    /// len (4) + flags (1)
    const PREFIX_SIZE: usize = 5;
    /// CRC size.
    const CRC_SIZE: usize = 4;

    /// Creates a put record from already-encoded value bytes.
    #[must_use]
    pub fn put(key: impl Into<String>, value: Vec<u8>, expire_at: Option<u64>) -> Self {
        let flags = if expire_at.is_some() {
            RecordFlags::HAS_EXPIRY
        } else {
            RecordFlags::NONE
        };
        Self {
            key: key.into(),
            flags,
            expire_at,
            value,
        }
    }

    /// Creates a tombstone record.
    #[must_use]
    pub fn tombstone(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            flags: RecordFlags::TOMBSTONE,
            expire_at: None,
            value: Vec::new(),
        }
    }

    /// Returns whether this is a tombstone.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.flags.is_tombstone()
    }

    /// Returns the encoded size of this record.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        let expiry = if self.expire_at.is_some() { 8 } else { 0 };
        Self::PREFIX_SIZE + expiry + prefixed_len(self.key.len()) + self.value.len() + Self::CRC_SIZE
    }

    /// Decodes the record's value.
    ///
    /// # Errors
    ///
    /// Returns an error for tombstones or undecodable value bytes.
    pub fn decode_value(&self) -> CoreResult<Value> {
        if self.is_tombstone() {
            return Err(CoreError::invalid_format("tombstone has no value"));
        }
        Ok(decode_value(&self.value)?)
    }

    /// Encodes the record to bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exceeds the 4 GiB frame limit.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let record_len = self.encoded_len();
        let frame_len = u32::try_from(record_len)
            .map_err(|_| CoreError::invalid_argument(format!("record too large: {record_len} bytes")))?;

        let mut buf = Vec::with_capacity(record_len);
        buf.extend_from_slice(&frame_len.to_le_bytes());
        buf.push(self.flags.as_byte());
        if let Some(at) = self.expire_at {
            buf.extend_from_slice(&at.to_le_bytes());
        }
        let mut key = Encoder::with_capacity(prefixed_len(self.key.len()));
        key.write_str(&self.key);
        buf.extend_from_slice(key.as_bytes());
        buf.extend_from_slice(&self.value);

        let crc = crc32fast::hash(&buf);
        buf.extend_from_slice(&crc.to_le_bytes());
        Ok(buf)
    }

    /// Decodes one record from the start of `data`.
    ///
    /// Returns the record and the number of bytes it occupies.
    ///
    /// # Errors
    ///
    /// Returns an error if the frame is truncated, fails its CRC or is
    /// internally inconsistent.
    pub fn decode(data: &[u8]) -> CoreResult<(Self, usize)> {
        let record_len = Self::frame_len(data)?;
        if data.len() < record_len {
            return Err(CoreError::corrupt_data(format!(
                "record truncated: need {record_len} bytes, have {}",
                data.len()
            )));
        }
        let frame = &data[..record_len];
        let crc_offset = record_len - Self::CRC_SIZE;

        let mut raw = [0u8; 4];
        raw.copy_from_slice(&frame[crc_offset..]);
        let stored_crc = u32::from_le_bytes(raw);
        let actual_crc = crc32fast::hash(&frame[..crc_offset]);
        if stored_crc != actual_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let flags = RecordFlags(frame[4]);
        if flags.as_byte() & !RecordFlags::KNOWN != 0 {
            return Err(CoreError::invalid_format(format!(
                "unknown record flags: {:#04x}",
                flags.as_byte()
            )));
        }

        let mut cursor = Self::PREFIX_SIZE;
        let expire_at = if flags.has_expiry() {
            let bytes = frame
                .get(cursor..cursor + 8)
                .ok_or_else(|| CoreError::corrupt_data("record expiry truncated"))?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(bytes);
            cursor += 8;
            Some(u64::from_le_bytes(raw))
        } else {
            None
        };

        let body = frame
            .get(cursor..crc_offset)
            .ok_or_else(|| CoreError::corrupt_data("record body truncated"))?;
        let mut dec = Decoder::new(body);
        let key = dec.read_str()?;
        let value = dec.remaining().to_vec();

        if flags.is_tombstone() != value.is_empty() {
            return Err(CoreError::corrupt_data(format!(
                "record for {key:?} has inconsistent tombstone flag"
            )));
        }

        Ok((
            Self {
                key,
                flags,
                expire_at,
                value,
            },
            record_len,
        ))
    }

    /// Reads the frame length from the start of `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the length prefix is missing or implausible.
    pub fn frame_len(data: &[u8]) -> CoreResult<usize> {
        let prefix = data
            .get(..4)
            .ok_or_else(|| CoreError::corrupt_data("record length truncated"))?;
        let mut raw = [0u8; 4];
        raw.copy_from_slice(prefix);
        let record_len = u32::from_le_bytes(raw) as usize;
        // Smallest frame: prefix, a one-byte key length and the CRC.
        if record_len < Self::PREFIX_SIZE + 1 + Self::CRC_SIZE {
            return Err(CoreError::corrupt_data(format!(
                "record length too small: {record_len}"
            )));
        }
        Ok(record_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapkv_codec::encode_value;

    #[test]
    fn put_roundtrip() {
        let record = Record::put("user", encode_value(&Value::Str("alice".into())), None);
        let bytes = record.encode().unwrap();
        assert_eq!(bytes.len(), record.encoded_len());

        let (decoded, consumed) = Record::decode(&bytes).unwrap();
        assert_eq!(consumed, bytes.len());
        assert_eq!(decoded, record);
        assert_eq!(decoded.decode_value().unwrap(), Value::Str("alice".into()));
    }

    #[test]
    fn expiry_roundtrip() {
        let record = Record::put("token", encode_value(&Value::U64(9)), Some(1_700_000_000));
        let bytes = record.encode().unwrap();
        let (decoded, _) = Record::decode(&bytes).unwrap();
        assert!(decoded.flags.has_expiry());
        assert_eq!(decoded.expire_at, Some(1_700_000_000));
    }

    #[test]
    fn tombstone_roundtrip() {
        let record = Record::tombstone("gone");
        let bytes = record.encode().unwrap();
        let (decoded, _) = Record::decode(&bytes).unwrap();
        assert!(decoded.is_tombstone());
        assert!(decoded.value.is_empty());
        assert!(decoded.decode_value().is_err());
    }

    #[test]
    fn decode_consumes_only_one_frame() {
        let mut bytes = Record::put("a", encode_value(&Value::Bool(true)), None)
            .encode()
            .unwrap();
        let first_len = bytes.len();
        bytes.extend(Record::tombstone("a").encode().unwrap());

        let (_, consumed) = Record::decode(&bytes).unwrap();
        assert_eq!(consumed, first_len);
        let (second, _) = Record::decode(&bytes[consumed..]).unwrap();
        assert!(second.is_tombstone());
    }

    #[test]
    fn corrupted_record_detected() {
        let mut bytes = Record::put("k", encode_value(&Value::I32(-5)), None)
            .encode()
            .unwrap();
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;
        assert!(matches!(
            Record::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_and_zero_frames_rejected() {
        let bytes = Record::put("k", encode_value(&Value::I32(1)), None)
            .encode()
            .unwrap();
        assert!(Record::decode(&bytes[..bytes.len() - 1]).is_err());
        assert!(Record::decode(&[0u8; 16]).is_err());
        assert!(Record::decode(&[]).is_err());
    }
}
