//! Instance registry.
//!
//! A [`Registry`] owns every store it opened, keyed by stem, root, mode and
//! whether a crypt key was given. Opening the same identity twice returns
//! the same `Arc<Store>`, so all callers in a process share one mapping and
//! one in-process lock per file.
//!
//! [`initialize`] installs one process-wide registry for hosts that want a
//! global entry point; [`Registry::new`] builds independent ones (tests and
//! the CLI use those).

use crate::backup::{self, BackupImage};
use crate::config::{Config, InitOptions, Mode, OpenOptions};
use crate::crypto::CryptKey;
use crate::error::{CoreError, CoreResult};
use crate::handlers::{ErrorKind, ErrorPolicy, Handlers};
use crate::layout::{list_stems, store_stem, StorePaths};
use crate::logging;
use crate::store::{Store, StoreOptions};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct InstanceKey {
    stem: String,
    root: PathBuf,
    mode: Mode,
    encrypted: bool,
}

/// Open stores of one process, or one test.
pub struct Registry {
    root: PathBuf,
    config: Config,
    handlers: Arc<Handlers>,
    stores: Mutex<HashMap<InstanceKey, Arc<Store>>>,
    opening: Mutex<HashMap<InstanceKey, Arc<Mutex<()>>>>,
}

impl Registry {
    /// Creates a registry whose stores default to `root`.
    pub fn new(root: impl Into<PathBuf>, config: Config) -> Self {
        Self {
            root: root.into(),
            config,
            handlers: Arc::new(Handlers::new()),
            stores: Mutex::new(HashMap::new()),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the default root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the configuration shared by every store.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Opens `id`, or returns the instance already open with the same
    /// identity.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::InvalidCryptKey`] if the id is already open with
    /// a different key, [`CoreError::CryptStateMismatch`] if the file's
    /// encryption state does not match `options`, and any I/O or lock error
    /// from opening the file.
    pub fn open(&self, id: &str, options: OpenOptions) -> CoreResult<Arc<Store>> {
        let stem = store_stem(id)?;
        let root = options.root_dir.unwrap_or_else(|| self.root.clone());
        let mode = options.mode.unwrap_or(self.config.default_mode);
        let key = InstanceKey {
            stem: stem.clone(),
            root: root.clone(),
            mode,
            encrypted: options.crypt_key.is_some(),
        };

        if let Some(store) = self.lookup(&key, id, options.crypt_key.as_ref())? {
            return Ok(store);
        }

        // Files open outside the registry lock. The per-identity gate keeps
        // a second caller from mapping the same file while the first loads.
        let gate = Arc::clone(self.opening.lock().entry(key.clone()).or_default());
        let _opening = gate.lock();
        if let Some(store) = self.lookup(&key, id, options.crypt_key.as_ref())? {
            return Ok(store);
        }

        let expected_capacity = if options.expected_capacity == 0 {
            self.config.default_expected_capacity
        } else {
            options.expected_capacity
        };
        let opened = Store::open(
            id,
            StorePaths::for_stem(&root, stem),
            StoreOptions {
                mode,
                crypt_key: options.crypt_key,
                expected_capacity,
            },
            &self.config,
            Arc::clone(&self.handlers),
        )
        .map(Arc::new);
        if let Ok(store) = &opened {
            self.stores.lock().insert(key.clone(), Arc::clone(store));
        }
        self.opening.lock().remove(&key);
        opened
    }

    fn lookup(&self, key: &InstanceKey, id: &str, crypt_key: Option<&CryptKey>) -> CoreResult<Option<Arc<Store>>> {
        let stores = self.stores.lock();
        match stores.get(key) {
            Some(store) if !store.crypt_key_matches(crypt_key) => {
                Err(CoreError::InvalidCryptKey { id: id.to_string() })
            }
            Some(store) => {
                debug!(id, "reusing open store");
                Ok(Some(Arc::clone(store)))
            }
            None => Ok(None),
        }
    }

    /// Opens `id` in the default root with default options.
    ///
    /// # Errors
    ///
    /// Same as [`Registry::open`].
    pub fn open_default(&self, id: &str) -> CoreResult<Arc<Store>> {
        self.open(id, OpenOptions::new())
    }

    /// Returns the number of open instances.
    #[must_use]
    pub fn open_count(&self) -> usize {
        self.stores.lock().len()
    }

    /// Closes and evicts every instance of `id` under `root` (default root
    /// if `None`). Returns `true` if any was open.
    pub fn close(&self, id: &str, root: Option<&Path>) -> bool {
        let Ok(stem) = store_stem(id) else {
            return false;
        };
        let evicted = self.evict(&stem, &self.resolve_root(root));
        let closed = !evicted.is_empty();
        for store in evicted {
            if let Err(e) = store.close() {
                warn!(id, error = %e, "flush on close failed");
            }
        }
        closed
    }

    // --- backup / restore -------------------------------------------------

    /// Copies the file of `id` into `dst_dir`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StorageNotFound`] if the store has no file, or
    /// an I/O or lock error.
    pub fn try_backup_one_to_directory(&self, id: &str, dst_dir: &Path, root: Option<&Path>) -> CoreResult<PathBuf> {
        let paths = StorePaths::for_id(&self.resolve_root(root), id)?;
        self.backup_stem(&paths, dst_dir)
    }

    /// Copies the file of `id` into `dst_dir`. Returns `false` on failure.
    pub fn backup_one_to_directory(&self, id: &str, dst_dir: &Path, root: Option<&Path>) -> bool {
        report(id, "backup", self.try_backup_one_to_directory(id, dst_dir, root)).is_some()
    }

    /// Copies every store file under `root` into `dst_dir`, skipping
    /// failures. Returns how many were copied.
    pub fn backup_all_to_directory(&self, dst_dir: &Path, root: Option<&Path>) -> usize {
        let root = self.resolve_root(root);
        let stems = match list_stems(&root) {
            Ok(stems) => stems,
            Err(e) => {
                error!(root = %root.display(), error = %e, "cannot list stores for backup");
                return 0;
            }
        };
        stems
            .iter()
            .filter(|stem| {
                let paths = StorePaths::for_stem(&root, stem.as_str());
                report(stem, "backup", self.backup_stem(&paths, dst_dir)).is_some()
            })
            .count()
    }

    /// Restores `id` from its copy in `src_dir`.
    ///
    /// The backup is validated before anything is written; on failure the
    /// store is left untouched.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::StorageNotFound`] if `src_dir` has no copy of
    /// `id`, a corruption error for a damaged copy, a key error for an
    /// encrypted copy the live store cannot read, or an I/O or lock error.
    pub fn try_restore_one_from_directory(&self, id: &str, src_dir: &Path, root: Option<&Path>) -> CoreResult<()> {
        let stem = store_stem(id)?;
        let target = StorePaths::for_stem(&self.resolve_root(root), stem.as_str());
        self.restore_stem(id, &StorePaths::for_stem(src_dir, stem), &target)
    }

    /// Restores `id` from its copy in `src_dir`. Returns `false` on failure.
    pub fn restore_one_from_directory(&self, id: &str, src_dir: &Path, root: Option<&Path>) -> bool {
        report(id, "restore", self.try_restore_one_from_directory(id, src_dir, root)).is_some()
    }

    /// Restores every store file in `src_dir` into `root`, skipping
    /// failures. Returns how many were restored.
    pub fn restore_all_from_directory(&self, src_dir: &Path, root: Option<&Path>) -> usize {
        let root = self.resolve_root(root);
        let stems = match list_stems(src_dir) {
            Ok(stems) => stems,
            Err(e) => {
                error!(src = %src_dir.display(), error = %e, "cannot list backups");
                return 0;
            }
        };
        stems
            .iter()
            .filter(|stem| {
                let source = StorePaths::for_stem(src_dir, stem.as_str());
                let target = StorePaths::for_stem(&root, stem.as_str());
                report(stem, "restore", self.restore_stem(stem, &source, &target)).is_some()
            })
            .count()
    }

    /// Closes every instance of `id` and deletes its files.
    ///
    /// # Errors
    ///
    /// Returns an error if a file exists but cannot be deleted.
    pub fn try_remove_storage(&self, id: &str, root: Option<&Path>) -> CoreResult<bool> {
        let root = self.resolve_root(root);
        let paths = StorePaths::for_id(&root, id)?;
        for store in self.evict(paths.stem(), &root) {
            if let Err(e) = store.close() {
                warn!(id, error = %e, "flush before removal failed");
            }
        }
        let removed = paths.remove_files()?;
        info!(id, removed, "removed storage");
        Ok(removed)
    }

    /// Closes every instance of `id` and deletes its files. Returns `false`
    /// on failure.
    pub fn remove_storage(&self, id: &str, root: Option<&Path>) -> bool {
        report(id, "remove_storage", self.try_remove_storage(id, root)).is_some()
    }

    // --- handlers ---------------------------------------------------------

    /// Installs the callback that picks an [`ErrorPolicy`] for damaged
    /// stores.
    pub fn register_error_handler(&self, handler: impl Fn(&str, ErrorKind) -> ErrorPolicy + Send + Sync + 'static) {
        self.handlers.set_error_handler(Some(Arc::new(handler)));
    }

    /// Removes the error handler; damaged stores are discarded.
    pub fn unregister_error_handler(&self) {
        self.handlers.set_error_handler(None);
    }

    /// Installs the callback told about changes made by other processes.
    pub fn register_content_change_handler(&self, handler: impl Fn(&str) + Send + Sync + 'static) {
        self.handlers.set_content_change_handler(Some(Arc::new(handler)));
    }

    /// Removes the content-change handler.
    pub fn unregister_content_change_handler(&self) {
        self.handlers.set_content_change_handler(None);
    }

    /// Flushes and closes every open store and releases their locks.
    pub fn on_exit(&self) {
        let stores: Vec<Arc<Store>> = self.stores.lock().drain().map(|(_, s)| s).collect();
        let count = stores.len();
        for store in stores {
            if let Err(e) = store.close() {
                warn!(id = store.id(), error = %e, "flush at exit failed");
            }
        }
        info!(count, "closed all stores");
    }

    fn resolve_root(&self, root: Option<&Path>) -> PathBuf {
        root.map_or_else(|| self.root.clone(), Path::to_path_buf)
    }

    fn live_instance(&self, stem: &str, root: &Path) -> Option<Arc<Store>> {
        self.stores
            .lock()
            .iter()
            .filter(|(key, _)| key.stem == stem && key.root == root)
            .map(|(key, store)| (key.mode.is_writable(), store))
            .max_by_key(|(writable, _)| *writable)
            .map(|(_, store)| Arc::clone(store))
    }

    fn evict(&self, stem: &str, root: &Path) -> Vec<Arc<Store>> {
        let mut stores = self.stores.lock();
        let keys: Vec<InstanceKey> = stores
            .keys()
            .filter(|key| key.stem == stem && key.root == root)
            .cloned()
            .collect();
        keys.iter().filter_map(|key| stores.remove(key)).collect()
    }

    fn backup_stem(&self, paths: &StorePaths, dst_dir: &Path) -> CoreResult<PathBuf> {
        match self.live_instance(paths.stem(), paths.root()) {
            Some(store) => backup::backup_live(&store, dst_dir),
            None => backup::backup_file(paths, dst_dir, &self.config),
        }
    }

    fn restore_stem(&self, id: &str, source: &StorePaths, target: &StorePaths) -> CoreResult<()> {
        let image = BackupImage::load(id, &source.data_path())?;
        match self.live_instance(target.stem(), target.root()) {
            Some(store) if store.mode().is_writable() => backup::restore_live(&store, &image),
            _ => backup::restore_file(target, &image, &self.config),
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("root", &self.root)
            .field("open", &self.open_count())
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

fn report<T>(id: &str, op: &'static str, result: CoreResult<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(e) => {
            warn!(id, op, error = %e, "operation failed");
            None
        }
    }
}

static GLOBAL: OnceLock<Registry> = OnceLock::new();

/// Installs logging and the process-wide registry.
///
/// Only the first call creates the registry; later calls update the log
/// level and handler and return the existing registry.
pub fn initialize(options: InitOptions) -> &'static Registry {
    logging::install(options.log_level, options.log_handler);
    let root = options.root_dir;
    let config = options.config;
    GLOBAL.get_or_init(|| {
        info!(root = %root.display(), "initialized");
        Registry::new(root, config)
    })
}

/// Returns the process-wide registry, if [`initialize`] was called.
#[must_use]
pub fn registry() -> Option<&'static Registry> {
    GLOBAL.get()
}

/// Closes every store of the process-wide registry.
pub fn on_exit() {
    if let Some(registry) = GLOBAL.get() {
        registry.on_exit();
    }
}
