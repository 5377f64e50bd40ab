//! Two-slot file header.
//!
//! The first [`HEADER_SIZE`] bytes of every backing file hold two copies
//! ("slots") of the header. A commit always writes the slot that is *not*
//! currently authoritative, so a torn header write leaves the previous
//! slot intact. On load the valid slot with the highest sequence wins.
//!
//! ```text
//! offset  size  field
//!      0     4  magic "MKV1"
//!      4     2  format version
//!      6     2  flags (bit 0: encrypted)
//!      8     8  capacity
//!     16     8  log start
//!     24     8  actual size
//!     32     4  content crc32 (over the on-disk log bytes)
//!     36     4  reserved
//!     40     8  sequence
//!     48    16  salt
//!     64    16  nonce
//!     80     8  key check
//!     88     4  slot crc32 (over bytes 0..88)
//!     92    36  zero padding
//! ```

use crate::error::{CoreError, CoreResult};

/// Total bytes reserved for the header at the start of the file.
pub const HEADER_SIZE: u64 = 256;

/// Size of one header slot.
pub const SLOT_SIZE: usize = 128;

/// Magic bytes identifying a MapKV file.
pub const MAGIC: [u8; 4] = *b"MKV1";

/// Current on-disk format version.
pub const FORMAT_VERSION: u16 = 1;

const FLAG_ENCRYPTED: u16 = 0x0001;
const BODY_LEN: usize = 88;

/// Decoded header slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    /// File capacity at the time of the commit.
    pub capacity: u64,
    /// Absolute offset of the first log byte.
    pub log_start: u64,
    /// Number of log bytes in use.
    pub actual_size: u64,
    /// CRC32 of the on-disk log bytes.
    pub content_crc: u32,
    /// Version counter, bumped by every commit.
    pub sequence: u64,
    /// Whether the log bytes are encrypted.
    pub encrypted: bool,
    /// HKDF salt for key derivation.
    pub salt: [u8; 16],
    /// CTR initial counter block for the current log.
    pub nonce: [u8; 16],
    /// Key fingerprint used to reject a wrong crypt key.
    pub key_check: [u8; 8],
}

impl Header {
    /// Creates the header of an empty store.
    #[must_use]
    pub fn new(capacity: u64) -> Self {
        Self {
            capacity,
            log_start: HEADER_SIZE,
            actual_size: 0,
            content_crc: 0,
            sequence: 0,
            encrypted: false,
            salt: [0; 16],
            nonce: [0; 16],
            key_check: [0; 8],
        }
    }

    /// Absolute offset one past the last log byte.
    #[must_use]
    pub fn log_end(&self) -> u64 {
        self.log_start.saturating_add(self.actual_size)
    }

    /// Slot index this header is written to.
    #[must_use]
    pub fn slot(&self) -> usize {
        (self.sequence % 2) as usize
    }

    /// Absolute file offset of this header's slot.
    #[must_use]
    pub fn slot_offset(&self) -> u64 {
        (self.slot() * SLOT_SIZE) as u64
    }

    /// Encodes the header into one slot.
    #[must_use]
    pub fn encode(&self) -> [u8; SLOT_SIZE] {
        let mut buf = [0u8; SLOT_SIZE];
        let flags = if self.encrypted { FLAG_ENCRYPTED } else { 0 };

        buf[0..4].copy_from_slice(&MAGIC);
        buf[4..6].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
        buf[6..8].copy_from_slice(&flags.to_le_bytes());
        buf[8..16].copy_from_slice(&self.capacity.to_le_bytes());
        buf[16..24].copy_from_slice(&self.log_start.to_le_bytes());
        buf[24..32].copy_from_slice(&self.actual_size.to_le_bytes());
        buf[32..36].copy_from_slice(&self.content_crc.to_le_bytes());
        buf[40..48].copy_from_slice(&self.sequence.to_le_bytes());
        buf[48..64].copy_from_slice(&self.salt);
        buf[64..80].copy_from_slice(&self.nonce);
        buf[80..88].copy_from_slice(&self.key_check);

        let crc = crc32fast::hash(&buf[..BODY_LEN]);
        buf[BODY_LEN..BODY_LEN + 4].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    /// Decodes and validates one slot.
    ///
    /// # Errors
    ///
    /// Returns an error if the slot is short, has the wrong magic or
    /// version, or fails its CRC.
    pub fn decode(slot: &[u8]) -> CoreResult<Self> {
        if slot.len() < SLOT_SIZE {
            return Err(CoreError::invalid_format("header slot too short"));
        }
        if slot[0..4] != MAGIC {
            return Err(CoreError::invalid_format("invalid header magic"));
        }

        let stored_crc = read_u32(slot, BODY_LEN);
        let actual_crc = crc32fast::hash(&slot[..BODY_LEN]);
        if stored_crc != actual_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let version = u16::from_le_bytes([slot[4], slot[5]]);
        if version != FORMAT_VERSION {
            return Err(CoreError::invalid_format(format!(
                "unsupported format version: {version}"
            )));
        }
        let flags = u16::from_le_bytes([slot[6], slot[7]]);

        let mut salt = [0u8; 16];
        salt.copy_from_slice(&slot[48..64]);
        let mut nonce = [0u8; 16];
        nonce.copy_from_slice(&slot[64..80]);
        let mut key_check = [0u8; 8];
        key_check.copy_from_slice(&slot[80..88]);

        let header = Self {
            capacity: read_u64(slot, 8),
            log_start: read_u64(slot, 16),
            actual_size: read_u64(slot, 24),
            content_crc: read_u32(slot, 32),
            sequence: read_u64(slot, 40),
            encrypted: flags & FLAG_ENCRYPTED != 0,
            salt,
            nonce,
            key_check,
        };

        if header.log_start < HEADER_SIZE {
            return Err(CoreError::invalid_format(format!(
                "log start {} overlaps the header",
                header.log_start
            )));
        }
        if header.log_start.checked_add(header.actual_size).is_none() {
            return Err(CoreError::invalid_format("log range overflows"));
        }
        Ok(header)
    }
}

/// Outcome of reading both slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderState {
    /// Both slots are zero: the file has never been committed.
    Blank,
    /// At least one slot validated; the newest one is returned.
    Valid(Header),
    /// Neither slot validated and the bytes are not blank.
    Damaged,
}

/// Reads the authoritative header from the first [`HEADER_SIZE`] bytes.
#[must_use]
pub fn read_header(bytes: &[u8]) -> HeaderState {
    let Some(prefix) = bytes.get(..HEADER_SIZE as usize) else {
        return HeaderState::Damaged;
    };
    if prefix.iter().all(|b| *b == 0) {
        return HeaderState::Blank;
    }

    let newest = prefix
        .chunks_exact(SLOT_SIZE)
        .filter_map(|slot| Header::decode(slot).ok())
        .max_by_key(|h| h.sequence);

    match newest {
        Some(header) => HeaderState::Valid(header),
        None => HeaderState::Damaged,
    }
}

/// Returns the sequence of the authoritative header, if any.
#[must_use]
pub fn peek_sequence(bytes: &[u8]) -> Option<u64> {
    match read_header(bytes) {
        HeaderState::Valid(h) => Some(h.sequence),
        _ => None,
    }
}

fn read_u32(buf: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&buf[at..at + 4]);
    u32::from_le_bytes(raw)
}

fn read_u64(buf: &[u8], at: usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&buf[at..at + 8]);
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Header {
        Header {
            capacity: 8192,
            log_start: HEADER_SIZE,
            actual_size: 321,
            content_crc: 0xdead_beef,
            sequence: 7,
            encrypted: true,
            salt: [1; 16],
            nonce: [2; 16],
            key_check: [3; 8],
        }
    }

    #[test]
    fn slot_roundtrip() {
        let header = sample();
        let decoded = Header::decode(&header.encode()).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn slot_alternates_with_sequence() {
        let mut header = sample();
        assert_eq!(header.slot_offset(), SLOT_SIZE as u64);
        header.sequence += 1;
        assert_eq!(header.slot_offset(), 0);
    }

    #[test]
    fn corrupted_slot_fails_crc() {
        let mut bytes = sample().encode();
        bytes[30] ^= 0xff;
        assert!(matches!(
            Header::decode(&bytes),
            Err(CoreError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn bad_magic_rejected() {
        let mut bytes = sample().encode();
        bytes[0] = b'X';
        assert!(matches!(
            Header::decode(&bytes),
            Err(CoreError::InvalidFormat { .. })
        ));
    }

    #[test]
    fn newest_valid_slot_wins() {
        let mut older = sample();
        older.sequence = 4;
        older.actual_size = 10;
        let mut newer = sample();
        newer.sequence = 5;
        newer.actual_size = 20;

        let mut bytes = vec![0u8; HEADER_SIZE as usize];
        bytes[older.slot_offset() as usize..][..SLOT_SIZE].copy_from_slice(&older.encode());
        bytes[newer.slot_offset() as usize..][..SLOT_SIZE].copy_from_slice(&newer.encode());
        assert_eq!(read_header(&bytes), HeaderState::Valid(newer.clone()));
        assert_eq!(peek_sequence(&bytes), Some(5));

        // Tear the newer slot: the older one takes over.
        bytes[newer.slot_offset() as usize + 20] ^= 0x55;
        assert_eq!(read_header(&bytes), HeaderState::Valid(older));
    }

    #[test]
    fn blank_and_damaged() {
        let bytes = vec![0u8; HEADER_SIZE as usize];
        assert_eq!(read_header(&bytes), HeaderState::Blank);

        let garbage = vec![0xAB; HEADER_SIZE as usize];
        assert_eq!(read_header(&garbage), HeaderState::Damaged);
        assert_eq!(read_header(&[0u8; 10]), HeaderState::Damaged);
    }
}
