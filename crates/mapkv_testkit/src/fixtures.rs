//! Test fixtures and store helpers.
//!
//! Every fixture owns a temporary directory, so files vanish when the
//! fixture is dropped.

use mapkv_core::{Config, CryptKey, Mode, OpenOptions, Registry, Store};
use std::fs::OpenOptions as FileOptions;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;

/// A registry rooted in a temporary directory.
pub struct TestRegistry {
    /// The registry instance.
    pub registry: Registry,
    temp_dir: TempDir,
}

impl TestRegistry {
    /// Creates a registry whose stores default to single-process mode.
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    /// Creates a registry whose stores default to multi-process mode.
    pub fn multi_process() -> Self {
        Self::with_config(Config::default().default_mode(Mode::MultiProcess))
    }

    /// Creates a registry with `config`.
    pub fn with_config(config: Config) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let registry = Registry::new(temp_dir.path(), config);
        Self { registry, temp_dir }
    }

    /// Creates a second registry over the same directory, standing in for
    /// another process.
    pub fn peer(&self, config: Config) -> Registry {
        Registry::new(self.temp_dir.path(), config)
    }

    /// Returns the store directory.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Returns a fresh sub-directory, e.g. for backups.
    pub fn subdir(&self, name: &str) -> PathBuf {
        let dir = self.temp_dir.path().join(name);
        std::fs::create_dir_all(&dir).expect("Failed to create sub-directory");
        dir
    }

    /// Opens `id` with default options.
    pub fn store(&self, id: &str) -> Arc<Store> {
        self.registry.open_default(id).expect("Failed to open store")
    }

    /// Opens `id` encrypted with `key`.
    pub fn open_encrypted(&self, id: &str, key: &str) -> Arc<Store> {
        let key = CryptKey::new(key).expect("Invalid crypt key");
        self.registry
            .open(id, OpenOptions::new().crypt_key(key))
            .expect("Failed to open encrypted store")
    }

    /// Returns the data file of `id`.
    pub fn data_path(&self, id: &str) -> PathBuf {
        mapkv_core::StorePaths::for_id(self.path(), id)
            .expect("Invalid store id")
            .data_path()
    }
}

impl Default for TestRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for TestRegistry {
    type Target = Registry;

    fn deref(&self) -> &Self::Target {
        &self.registry
    }
}

/// Runs a test with a store in a temporary directory.
///
/// # Example
///
/// ```rust,ignore
/// use mapkv_testkit::with_temp_store;
///
/// #[test]
/// fn my_test() {
///     with_temp_store(|store| {
///         store.set("k", true);
///     });
/// }
/// ```
pub fn with_temp_store<F, R>(f: F) -> R
where
    F: FnOnce(&Store) -> R,
{
    let registry = TestRegistry::new();
    let store = registry.store("test");
    f(&store)
}

/// Overwrites `bytes` at `offset` in the file at `path`.
pub fn corrupt_file(path: &Path, offset: u64, bytes: &[u8]) {
    let mut file = FileOptions::new()
        .write(true)
        .open(path)
        .expect("Failed to open file for corruption");
    file.seek(SeekFrom::Start(offset)).expect("Failed to seek");
    file.write_all(bytes).expect("Failed to corrupt file");
    file.sync_all().expect("Failed to sync file");
}

/// Test scenario helpers.
pub mod scenarios {
    use super::*;

    /// Creates a registry holding store `id` with `count` string entries
    /// `key_{i}` → `value_{i}`.
    pub fn populated_store(id: &str, count: usize) -> (TestRegistry, Arc<Store>) {
        let registry = TestRegistry::new();
        let store = registry.store(id);
        for i in 0..count {
            assert!(store.set(&format!("key_{i}"), format!("value_{i}")));
        }
        (registry, store)
    }
}
