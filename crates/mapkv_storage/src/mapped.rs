//! File-backed memory-mapped region.

use crate::error::{StorageError, StorageResult};
use crate::region::{checked_range, Region};
use memmap2::MmapMut;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// A region backed by a shared, writable memory mapping of a file.
///
/// Writes go straight into the page cache and are visible to every other
/// process mapping the same file. `flush_range` / `flush` call `msync`
/// so the bytes survive a crash.
///
/// # Growth
///
/// [`Region::resize`] flushes, unmaps, changes the file length and maps
/// again. If the remap fails the region is left unmapped and every access
/// returns [`StorageError::Unmapped`]; callers treat that as fatal for the
/// store instance.
///
/// # Example
///
/// ```no_run
/// use mapkv_storage::{MappedRegion, Region};
/// use std::path::Path;
///
/// let mut region = MappedRegion::open(Path::new("data.mkv"), 4096).unwrap();
/// region.write_at(0, b"persistent").unwrap();
/// region.flush_range(0, 10).unwrap();
/// ```
#[derive(Debug)]
pub struct MappedRegion {
    path: PathBuf,
    file: File,
    map: Option<MmapMut>,
    len: u64,
}

impl MappedRegion {
    /// Opens or creates the file at `path` and maps it.
    ///
    /// A file shorter than `min_len` (including a new, empty file) is
    /// extended with zeros to `min_len` first.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened, extended or mapped.
    pub fn open(path: &Path, min_len: u64) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;

        let mut len = file.metadata()?.len();
        if len < min_len {
            file.set_len(min_len)?;
            len = min_len;
        }
        if len == 0 {
            return Err(StorageError::InvalidSize(0));
        }

        let map = Self::map(&file, len)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
            map: Some(map),
            len,
        })
    }

    /// Returns the path to the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[allow(unsafe_code)]
    fn map(file: &File, len: u64) -> StorageResult<MmapMut> {
        let len = usize::try_from(len).map_err(|_| StorageError::InvalidSize(len))?;
        // SAFETY: the mapping is only handed out as slices borrowed from
        // `self`, and remapping requires `&mut self`, so no slice outlives
        // the mapping it points into. Other processes may write to the file
        // concurrently; the store serializes those writes with file locks.
        let map = unsafe { memmap2::MmapOptions::new().len(len).map_mut(file)? };
        Ok(map)
    }

    fn remap(&mut self, new_len: u64) -> StorageResult<()> {
        self.map = None;
        match Self::map(&self.file, new_len) {
            Ok(map) => {
                self.map = Some(map);
                self.len = new_len;
                Ok(())
            }
            Err(e) => {
                error!(path = %self.path.display(), new_len, error = %e, "remap failed");
                Err(e)
            }
        }
    }
}

impl Region for MappedRegion {
    fn as_slice(&self) -> StorageResult<&[u8]> {
        self.map.as_deref().ok_or(StorageError::Unmapped)
    }

    fn as_mut_slice(&mut self) -> StorageResult<&mut [u8]> {
        self.map.as_deref_mut().ok_or(StorageError::Unmapped)
    }

    fn flush_range(&self, offset: u64, len: usize) -> StorageResult<()> {
        let map = self.map.as_ref().ok_or(StorageError::Unmapped)?;
        let range = checked_range(offset, len, map.len())?;
        if range.is_empty() {
            return Ok(());
        }
        map.flush_range(range.start, range.len())?;
        Ok(())
    }

    fn flush(&self) -> StorageResult<()> {
        let map = self.map.as_ref().ok_or(StorageError::Unmapped)?;
        map.flush()?;
        Ok(())
    }

    fn resize(&mut self, new_len: u64) -> StorageResult<()> {
        if new_len == 0 {
            return Err(StorageError::InvalidSize(0));
        }
        if new_len == self.len && self.map.is_some() {
            return Ok(());
        }
        if let Some(map) = self.map.as_ref() {
            map.flush()?;
        }
        debug!(path = %self.path.display(), old_len = self.len, new_len, "resizing region");
        self.map = None;
        self.file.set_len(new_len)?;
        self.remap(new_len)
    }

    fn refresh(&mut self) -> StorageResult<bool> {
        let file_len = self.file.metadata()?.len();
        if file_len == self.len && self.map.is_some() {
            return Ok(false);
        }
        if file_len == 0 {
            return Err(StorageError::InvalidSize(0));
        }
        debug!(path = %self.path.display(), old_len = self.len, file_len, "remapping after external resize");
        self.remap(file_len)?;
        Ok(true)
    }

    fn len(&self) -> u64 {
        self.len
    }
}
