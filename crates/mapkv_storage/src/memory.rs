//! In-memory region for testing.

use crate::error::{StorageError, StorageResult};
use crate::region::{checked_range, Region};

/// A heap-allocated region.
///
/// Suitable for:
/// - Unit tests of the log and compaction code
/// - Scratch stores that never need persistence
///
/// Flushes are no-ops and `refresh` never remaps.
///
/// # Example
///
/// ```rust
/// use mapkv_storage::{MemoryRegion, Region};
///
/// let mut region = MemoryRegion::new(64);
/// region.write_at(8, b"test data").unwrap();
/// assert_eq!(region.read(8, 9).unwrap(), b"test data");
/// assert_eq!(region.len(), 64);
/// ```
#[derive(Debug, Default, Clone)]
pub struct MemoryRegion {
    data: Vec<u8>,
}

impl MemoryRegion {
    /// Creates a zero-filled region of `len` bytes.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self {
            data: vec![0; len],
        }
    }

    /// Creates a region holding pre-existing data.
    ///
    /// Useful for testing recovery from crafted or damaged bytes.
    #[must_use]
    pub fn with_data(data: Vec<u8>) -> Self {
        Self { data }
    }

    /// Returns a copy of all bytes in the region.
    #[must_use]
    pub fn data(&self) -> Vec<u8> {
        self.data.clone()
    }
}

impl Region for MemoryRegion {
    fn as_slice(&self) -> StorageResult<&[u8]> {
        Ok(&self.data)
    }

    fn as_mut_slice(&mut self) -> StorageResult<&mut [u8]> {
        Ok(&mut self.data)
    }

    fn flush_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        checked_range(offset, len, self.data.len())?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        Ok(())
    }

    fn resize(&mut self, new_len: u64) -> StorageResult<()> {
        let new_len = usize::try_from(new_len).map_err(|_| StorageError::InvalidSize(new_len))?;
        self.data.resize(new_len, 0);
        Ok(())
    }

    fn refresh(&mut self) -> StorageResult<bool> {
        Ok(false)
    }

    fn len(&self) -> u64 {
        self.data.len() as u64
    }
}
