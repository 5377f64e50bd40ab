//! Region trait definition.

use crate::error::{StorageError, StorageResult};

/// A fixed-size, randomly addressable byte region.
///
/// Regions are **opaque byte stores**: they know nothing about headers,
/// records or encryption. The store owns all format interpretation and
/// decides when to grow.
///
/// # Invariants
///
/// - `len()` is the full addressable size (the capacity), not the used size
/// - bytes written with `write_at` are visible to `read` immediately
/// - `flush_range` returns only after the range is durable
/// - `resize` preserves the common prefix of old and new content
///
/// # Implementors
///
/// - [`super::MappedRegion`] - shared memory mapping of a file
/// - [`super::MemoryRegion`] - heap buffer, for tests
pub trait Region: Send + Sync {
    /// Returns the whole region as a slice.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unmapped`] if the backing mapping is gone.
    fn as_slice(&self) -> StorageResult<&[u8]>;

    /// Returns the whole region as a mutable slice.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Unmapped`] if the backing mapping is gone.
    fn as_mut_slice(&mut self) -> StorageResult<&mut [u8]>;

    /// Flushes `len` bytes starting at `offset` to durable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the range is out of bounds or the flush fails.
    fn flush_range(&self, offset: u64, len: usize) -> StorageResult<()>;

    /// Flushes the whole region.
    ///
    /// # Errors
    ///
    /// Returns an error if the flush fails.
    fn flush(&self) -> StorageResult<()>;

    /// Changes the region size, keeping existing content.
    ///
    /// New bytes read as zero.
    ///
    /// # Errors
    ///
    /// Returns an error if the backing store cannot be resized or remapped.
    fn resize(&mut self, new_len: u64) -> StorageResult<()>;

    /// Re-reads the backing size and remaps if another writer resized it.
    ///
    /// Returns `true` if the region was remapped.
    ///
    /// # Errors
    ///
    /// Returns an error if remapping fails.
    fn refresh(&mut self) -> StorageResult<bool>;

    /// Returns the current region size in bytes.
    fn len(&self) -> u64;

    /// Returns `true` if the region has no bytes.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reads `len` bytes starting at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if the range is not inside the region.
    fn read(&self, offset: u64, len: usize) -> StorageResult<&[u8]> {
        let data = self.as_slice()?;
        let range = checked_range(offset, len, data.len())?;
        Ok(&data[range])
    }

    /// Writes `data` at `offset`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if the write does not fit.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let region = self.as_mut_slice()?;
        let range = checked_range(offset, data.len(), region.len())?;
        region[range].copy_from_slice(data);
        Ok(())
    }

    /// Copies `len` bytes from `src` to `dst` inside the region.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::OutOfBounds`] if either range does not fit.
    fn copy_within(&mut self, src: u64, len: usize, dst: u64) -> StorageResult<()> {
        let region = self.as_mut_slice()?;
        let src_range = checked_range(src, len, region.len())?;
        checked_range(dst, len, region.len())?;
        #[allow(clippy::cast_possible_truncation)]
        region.copy_within(src_range, dst as usize);
        Ok(())
    }
}

/// Validates `offset..offset + len` against a region of `size` bytes.
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn checked_range(
    offset: u64,
    len: usize,
    size: usize,
) -> StorageResult<std::ops::Range<usize>> {
    let out_of_bounds = || StorageError::OutOfBounds {
        offset,
        len,
        size: size as u64,
    };
    let start = usize::try_from(offset).map_err(|_| out_of_bounds())?;
    let end = start.checked_add(len).ok_or_else(out_of_bounds)?;
    if end > size {
        return Err(out_of_bounds());
    }
    Ok(start..end)
}
