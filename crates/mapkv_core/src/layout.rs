//! On-disk layout of a store directory.
//!
//! ```text
//! <root>/
//! ├─ <stem>.mkv        # header slots followed by the append log
//! └─ <stem>.lock       # advisory lock file shared by every process
//! ```
//!
//! The stem is the store id itself when it is a safe file name, otherwise
//! the hex SHA-256 of the id. Several ids therefore never collide and odd
//! characters never reach the file system.

use crate::error::{CoreError, CoreResult};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Extension of the backing data file.
pub const DATA_EXT: &str = "mkv";
/// Extension of the lock file.
pub const LOCK_EXT: &str = "lock";
/// Suffix of a damaged data file set aside before a reset.
const DAMAGED_EXT: &str = "damaged";
/// Extension used while a file is being copied into place.
const TEMP_EXT: &str = "tmp";

/// Longest id that is used verbatim as a file stem.
pub const MAX_PLAIN_STEM: usize = 128;

/// Maps a store id to its file stem.
///
/// # Errors
///
/// Returns an error if the id is empty.
pub fn store_stem(id: &str) -> CoreResult<String> {
    if id.is_empty() {
        return Err(CoreError::invalid_argument("store id must not be empty"));
    }
    let plain = id.len() <= MAX_PLAIN_STEM
        && !id.starts_with('.')
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'.' | b'_' | b'-'));
    if plain {
        return Ok(id.to_string());
    }
    let digest = Sha256::digest(id.as_bytes());
    Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
}

/// Paths of one store's files.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorePaths {
    root: PathBuf,
    stem: String,
}

impl StorePaths {
    /// Builds the paths for `id` under `root`.
    ///
    /// # Errors
    ///
    /// Returns an error if the id is empty.
    pub fn for_id(root: &Path, id: &str) -> CoreResult<Self> {
        Ok(Self::for_stem(root, store_stem(id)?))
    }

    /// Builds the paths for an already-derived stem.
    #[must_use]
    pub fn for_stem(root: &Path, stem: impl Into<String>) -> Self {
        Self {
            root: root.to_path_buf(),
            stem: stem.into(),
        }
    }

    /// Returns the root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the file stem.
    #[must_use]
    pub fn stem(&self) -> &str {
        &self.stem
    }

    /// Returns the backing data file path.
    #[must_use]
    pub fn data_path(&self) -> PathBuf {
        self.root.join(format!("{}.{DATA_EXT}", self.stem))
    }

    /// Returns the lock file path.
    #[must_use]
    pub fn lock_path(&self) -> PathBuf {
        self.root.join(format!("{}.{LOCK_EXT}", self.stem))
    }

    /// Returns where a damaged data file is set aside before it is reset.
    #[must_use]
    pub fn damaged_path(&self) -> PathBuf {
        self.root.join(format!("{}.{DATA_EXT}.{DAMAGED_EXT}", self.stem))
    }

    /// Returns `true` if the data file exists.
    #[must_use]
    pub fn exists(&self) -> bool {
        self.data_path().is_file()
    }

    /// Deletes the data and lock files, and any set-aside damaged copy.
    ///
    /// Missing files are ignored. Returns `true` if anything was deleted.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be deleted.
    pub fn remove_files(&self) -> CoreResult<bool> {
        let mut removed = false;
        for path in [self.data_path(), self.lock_path(), self.damaged_path()] {
            match fs::remove_file(&path) {
                Ok(()) => removed = true,
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        if removed {
            sync_directory(&self.root)?;
        }
        Ok(removed)
    }
}

/// Lists the stems of every data file in `dir`, sorted.
///
/// # Errors
///
/// Returns an error if the directory cannot be read.
pub fn list_stems(dir: &Path) -> CoreResult<Vec<String>> {
    let mut stems = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if !path.is_file() || path.extension().and_then(|e| e.to_str()) != Some(DATA_EXT) {
            continue;
        }
        if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
            stems.push(stem.to_string());
        }
    }
    stems.sort();
    Ok(stems)
}

/// Copies `src` to `dst` through a temporary file and a rename, so `dst`
/// is either the old file or the complete new one.
///
/// # Errors
///
/// Returns an error if the copy, sync or rename fails.
pub(crate) fn copy_atomic(src: &Path, dst: &Path) -> CoreResult<u64> {
    let temp = dst.with_extension(TEMP_EXT);
    let copied = fs::copy(src, &temp)?;
    File::open(&temp)?.sync_all()?;
    fs::rename(&temp, dst)?;
    if let Some(parent) = dst.parent() {
        sync_directory(parent)?;
    }
    Ok(copied)
}

/// Syncs a directory so created, renamed or deleted entries are durable.
#[cfg(unix)]
pub(crate) fn sync_directory(path: &Path) -> CoreResult<()> {
    File::open(path)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
pub(crate) fn sync_directory(_path: &Path) -> CoreResult<()> {
    // NTFS journals metadata; directories cannot be opened for fsync.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn safe_ids_are_used_verbatim() {
        assert_eq!(store_stem("user-prefs_v2.1").unwrap(), "user-prefs_v2.1");
    }

    #[test]
    fn unsafe_ids_are_hashed() {
        let stem = store_stem("a/b").unwrap();
        assert_eq!(stem.len(), 64);
        assert!(stem.bytes().all(|b| b.is_ascii_hexdigit()));
        assert_ne!(stem, store_stem("a\\b").unwrap());

        assert_eq!(store_stem("..").unwrap().len(), 64);
        assert_eq!(store_stem(&"x".repeat(MAX_PLAIN_STEM + 1)).unwrap().len(), 64);
        assert_eq!(store_stem(&"x".repeat(MAX_PLAIN_STEM)).unwrap().len(), MAX_PLAIN_STEM);
    }

    #[test]
    fn empty_id_rejected() {
        assert!(matches!(
            store_stem(""),
            Err(CoreError::InvalidArgument { .. })
        ));
    }

    #[test]
    fn paths_and_listing() {
        let dir = tempdir().unwrap();
        let paths = StorePaths::for_id(dir.path(), "settings").unwrap();
        assert_eq!(paths.data_path(), dir.path().join("settings.mkv"));
        assert_eq!(paths.lock_path(), dir.path().join("settings.lock"));
        assert_eq!(paths.damaged_path(), dir.path().join("settings.mkv.damaged"));
        assert!(!paths.exists());

        fs::write(paths.data_path(), b"x").unwrap();
        fs::write(paths.lock_path(), b"").unwrap();
        fs::write(paths.damaged_path(), b"old").unwrap();
        fs::write(dir.path().join("other.mkv"), b"y").unwrap();
        fs::write(dir.path().join("notes.txt"), b"z").unwrap();

        assert_eq!(list_stems(dir.path()).unwrap(), vec!["other", "settings"]);

        assert!(paths.remove_files().unwrap());
        assert!(!paths.exists());
        assert!(!paths.lock_path().exists());
        assert!(!paths.damaged_path().exists());
        assert!(!paths.remove_files().unwrap());
    }

    #[test]
    fn atomic_copy_replaces_target() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.mkv");
        let dst = dir.path().join("b.mkv");
        fs::write(&src, b"new content").unwrap();
        fs::write(&dst, b"old").unwrap();

        assert_eq!(copy_atomic(&src, &dst).unwrap(), 11);
        assert_eq!(fs::read(&dst).unwrap(), b"new content");
        assert!(!dir.path().join("b.tmp").exists());
    }
}
