//! A single open store.
//!
//! [`Store`] wraps one append log with the cross-process protocol:
//!
//! - reads take the shared file lock, compare the on-disk sequence with the
//!   one last loaded, and reload first if another process committed
//! - writes take the exclusive file lock, reload if needed, then append and
//!   commit before releasing it
//!
//! Lock order is always the file lock first, then the in-process state lock.
//!
//! Most operations exist twice: a `try_*` method returning [`CoreResult`]
//! and a binding-style method that logs failures and returns `bool`, the
//! caller's default or an empty collection.

use crate::change_feed::{ChangeFeed, ChangeOrigin, ContentChange};
use crate::compaction::{CompactionPolicy, CompactionResult};
use crate::config::{Config, Mode};
use crate::crypto::CryptKey;
use crate::error::{CoreError, CoreResult};
use crate::expiry::{is_expired, now_secs, Ttl};
use crate::handlers::{ErrorKind, ErrorPolicy, Handlers};
use crate::header::{Header, HEADER_SIZE};
use crate::layout::{copy_atomic, StorePaths};
use crate::lock::{LockGuard, LockKind, ProcessLock};
use crate::log::AppendLog;
use crate::record::Record;
use crate::stats::StoreStats;
use mapkv_codec::{check_encodable, check_length, encode_value, FromValue, Value};
use mapkv_storage::{round_to_page, MappedRegion};
use parking_lot::{RwLock, RwLockWriteGuard};
use std::path::Path;
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Settings a store is opened with, after registry defaults are applied.
#[derive(Debug, Clone)]
pub(crate) struct StoreOptions {
    pub mode: Mode,
    pub crypt_key: Option<CryptKey>,
    pub expected_capacity: u64,
}

struct StoreState {
    /// `None` once the store is closed.
    log: Option<AppendLog>,
    /// Set by [`ErrorPolicy::Keep`]; the next write discards the file first.
    pending_reset: bool,
    auto_expire: Option<u32>,
    compare_before_set: bool,
    /// Header sequence of the content currently indexed.
    loaded_sequence: u64,
}

/// An open key-value store.
///
/// Obtained from [`crate::Registry::open`] and shared as `Arc<Store>` by
/// every caller that opens the same id with the same settings.
///
/// # Example
///
/// ```rust,no_run
/// use mapkv_core::{OpenOptions, Registry, Config};
///
/// let registry = Registry::new("/tmp/mapkv", Config::default());
/// let store = registry.open("prefs", OpenOptions::new()).unwrap();
/// store.set("launches", 3u32);
/// assert_eq!(store.get_u32("launches", 0), 3);
/// ```
pub struct Store {
    id: String,
    paths: StorePaths,
    mode: Mode,
    encrypted: bool,
    base_capacity: u64,
    lock: Option<ProcessLock>,
    state: RwLock<StoreState>,
    policy: CompactionPolicy,
    handlers: Arc<Handlers>,
    feed: ChangeFeed,
    stats: Arc<StoreStats>,
}

impl Store {
    /// Opens or creates the store at `paths`.
    ///
    /// Damaged content is handed to the registered error handler and the
    /// chosen policy is applied before this returns.
    pub(crate) fn open(
        id: &str,
        paths: StorePaths,
        options: StoreOptions,
        config: &Config,
        handlers: Arc<Handlers>,
    ) -> CoreResult<Self> {
        let mode = options.mode;
        if !mode.is_writable() && !paths.exists() {
            return Err(CoreError::storage_not_found(id));
        }
        if mode.is_writable() {
            std::fs::create_dir_all(paths.root())?;
        }

        let lock = if mode.uses_file_lock() {
            Some(ProcessLock::open(id, &paths.lock_path(), config.lock_timeout)?)
        } else {
            None
        };
        let base_capacity = round_to_page(HEADER_SIZE + options.expected_capacity);

        let store = Self {
            id: id.to_string(),
            paths,
            mode,
            encrypted: options.crypt_key.is_some(),
            base_capacity,
            lock,
            state: RwLock::new(StoreState {
                log: None,
                pending_reset: false,
                auto_expire: None,
                compare_before_set: config.compare_before_set,
                loaded_sequence: 0,
            }),
            policy: CompactionPolicy::new(config.compaction_ratio, config.compaction_min_stale_bytes),
            handlers,
            feed: ChangeFeed::new(),
            stats: Arc::new(StoreStats::new()),
        };
        store.load(options.crypt_key, config.sync_on_write)?;
        info!(id, ?mode, encrypted = store.encrypted, "opened store");
        Ok(store)
    }

    fn load(&self, crypt_key: Option<CryptKey>, sync_on_write: bool) -> CoreResult<()> {
        let writable = self.mode.is_writable();
        let held = if writable {
            LockKind::Exclusive
        } else {
            LockKind::Shared
        };
        let _file = self.file_lock(held)?;
        let min_len = if writable { self.base_capacity } else { 0 };
        let region = MappedRegion::open(&self.paths.data_path(), min_len)?;
        let (log, damage) = AppendLog::open(
            &self.id,
            Box::new(region),
            crypt_key,
            sync_on_write,
            writable,
            Arc::clone(&self.stats),
        )?;

        let mut state = self.state.write();
        state.log = Some(log);
        self.settle(&mut state, damage)?;
        state.loaded_sequence = self.log(&state)?.header().sequence;
        Ok(())
    }

    // --- accessors --------------------------------------------------------

    /// Returns the store id.
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Returns the coordination mode.
    #[must_use]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Returns `true` if the store was opened with a crypt key.
    #[must_use]
    pub fn is_encrypted(&self) -> bool {
        self.encrypted
    }

    /// Returns the file locations.
    #[must_use]
    pub fn paths(&self) -> &StorePaths {
        &self.paths
    }

    /// Returns the operation counters.
    #[must_use]
    pub fn stats(&self) -> &StoreStats {
        &self.stats
    }

    /// Returns `true` until [`Store::close`] is called.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.state.read().log.is_some()
    }

    /// Subscribes to content changes made by other processes, restores and
    /// recoveries.
    pub fn subscribe(&self) -> Receiver<ContentChange> {
        self.feed.subscribe()
    }

    /// Returns `true` if `key` matches the key this store was opened with.
    pub(crate) fn crypt_key_matches(&self, key: Option<&CryptKey>) -> bool {
        let state = self.state.read();
        let Some(log) = state.log.as_ref() else {
            return false;
        };
        match (log.crypt_key(), key) {
            (None, None) => true,
            (Some(a), Some(b)) => a.as_bytes() == b.as_bytes(),
            _ => false,
        }
    }

    // --- writes -----------------------------------------------------------

    /// Stores `value` under `key` with the default TTL.
    ///
    /// Returns `Ok(false)` if compare-before-set skipped the write.
    ///
    /// # Errors
    ///
    /// Returns an error for an empty key, a read-only or closed store, a
    /// lock timeout or an I/O failure.
    pub fn try_set(&self, key: &str, value: impl Into<Value>) -> CoreResult<bool> {
        self.try_set_with_ttl(key, value, Ttl::Default)
    }

    /// Stores `value` under `key` with an explicit TTL.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`].
    pub fn try_set_with_ttl(&self, key: &str, value: impl Into<Value>, ttl: Ttl) -> CoreResult<bool> {
        check_key(key)?;
        let value = value.into();
        check_encodable(&value).map_err(|e| CoreError::invalid_argument(format!("value for {key}: {e}")))?;
        self.write(|state| {
            let now = now_secs();
            let expire_at = ttl.resolve(state.auto_expire, now);
            let bytes = encode_value(&value);
            let compare = state.compare_before_set;
            let log = self.log_mut(state)?;

            if compare && expire_at.is_none() {
                if let Some(existing) = log.live_record(key, now)? {
                    if existing.expire_at.is_none() && existing.value == bytes {
                        debug!(id = %self.id, key, "value unchanged, write skipped");
                        return Ok(false);
                    }
                }
            }

            let len = log.append(&Record::put(key, bytes, expire_at), &self.policy)?;
            self.stats.record_write(len);
            log.maybe_compact(&self.policy)?;
            Ok(true)
        })
    }

    /// Stores `value` under `key`. Returns `false` on failure.
    pub fn set(&self, key: &str, value: impl Into<Value>) -> bool {
        self.report("set", self.try_set(key, value)).is_some()
    }

    /// Stores `value` under `key`, expiring after `ttl_secs` seconds.
    ///
    /// `0` means the value never expires, even with auto-expire enabled.
    pub fn set_with_ttl(&self, key: &str, value: impl Into<Value>, ttl_secs: u32) -> bool {
        self.report("set", self.try_set_with_ttl(key, value, Ttl::from_secs(ttl_secs)))
            .is_some()
    }

    /// Removes `key`. Returns `Ok(true)` if it was present.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`].
    pub fn try_remove(&self, key: &str) -> CoreResult<bool> {
        self.try_remove_many(&[key]).map(|n| n > 0)
    }

    /// Removes every key in `keys`, returning how many were present.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`]. Keys removed before a failure stay removed.
    pub fn try_remove_many<K: AsRef<str>>(&self, keys: &[K]) -> CoreResult<usize> {
        self.write(|state| {
            let log = self.log_mut(state)?;
            let mut removed = 0;
            for key in keys {
                let key = key.as_ref();
                if !log.index().contains_key(key) {
                    continue;
                }
                let len = log.append(&Record::tombstone(key), &self.policy)?;
                self.stats.record_remove(len);
                removed += 1;
            }
            if removed > 0 {
                log.maybe_compact(&self.policy)?;
            }
            Ok(removed)
        })
    }

    /// Removes `key`. Returns `false` only on failure.
    pub fn remove(&self, key: &str) -> bool {
        self.report("remove", self.try_remove(key)).is_some()
    }

    /// Removes every key in `keys`. Returns `false` only on failure.
    pub fn remove_many<K: AsRef<str>>(&self, keys: &[K]) -> bool {
        self.report("remove", self.try_remove_many(keys)).is_some()
    }

    /// Removes every key and shrinks the file back to its initial size.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`].
    pub fn try_clear_all(&self) -> CoreResult<()> {
        self.write(|state| {
            let capacity = self.base_capacity;
            self.log_mut(state)?.clear(capacity)
        })
    }

    /// Removes every key. Returns `false` on failure.
    pub fn clear_all(&self) -> bool {
        self.report("clear_all", self.try_clear_all()).is_some()
    }

    /// Compacts the log and shrinks the file to fit the live data.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`].
    pub fn try_trim(&self) -> CoreResult<()> {
        self.write(|state| self.log_mut(state)?.trim(&self.policy))
    }

    /// Compacts and shrinks the file. Returns `false` on failure.
    pub fn trim(&self) -> bool {
        self.report("trim", self.try_trim()).is_some()
    }

    /// Rewrites the log with only live records, regardless of thresholds.
    ///
    /// # Errors
    ///
    /// Same as [`Store::try_set`].
    pub fn try_compact(&self) -> CoreResult<CompactionResult> {
        self.write(|state| self.log_mut(state)?.compact(0, &self.policy))
    }

    // --- reads ------------------------------------------------------------

    /// Returns the live value of `key`.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store, a lock timeout or a record that
    /// no longer decodes.
    pub fn try_get_value(&self, key: &str) -> CoreResult<Option<Value>> {
        self.stats.record_read();
        self.read(|state| {
            let log = self.log(state)?;
            match log.live_record(key, now_secs())? {
                Some(record) => record.decode_value().map(Some),
                None => Ok(None),
            }
        })
    }

    /// Returns the live value of `key`, or `None` if it is missing, expired
    /// or unreadable.
    pub fn get_value(&self, key: &str) -> Option<Value> {
        self.report("get", self.try_get_value(key)).flatten()
    }

    /// Returns the value of `key` converted to `T`, or `None` if it is
    /// missing or holds another type.
    pub fn get<T: FromValue>(&self, key: &str) -> Option<T> {
        self.get_value(key).and_then(T::from_value)
    }

    /// Returns the bool under `key`, or `default`.
    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        self.get(key).unwrap_or(default)
    }

    /// Returns the i32 under `key`, or `default`.
    pub fn get_i32(&self, key: &str, default: i32) -> i32 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the u32 under `key`, or `default`.
    pub fn get_u32(&self, key: &str, default: u32) -> u32 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the i64 under `key`, or `default`.
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the u64 under `key`, or `default`.
    pub fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the f32 under `key`, or `default`.
    pub fn get_f32(&self, key: &str, default: f32) -> f32 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the f64 under `key`, or `default`.
    pub fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key).unwrap_or(default)
    }

    /// Returns the string under `key`, or `default`.
    pub fn get_string(&self, key: &str, default: &str) -> String {
        self.get(key).unwrap_or_else(|| default.to_string())
    }

    /// Returns the bytes under `key`, or `default`.
    pub fn get_bytes(&self, key: &str, default: &[u8]) -> Vec<u8> {
        self.get(key).unwrap_or_else(|| default.to_vec())
    }

    /// Returns the string list under `key`, or `default`.
    pub fn get_string_list(&self, key: &str, default: &[String]) -> Vec<String> {
        self.get(key).unwrap_or_else(|| default.to_vec())
    }

    /// Returns `true` if `key` holds a live value.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn try_contains(&self, key: &str) -> CoreResult<bool> {
        self.read(|state| {
            let now = now_secs();
            Ok(self
                .log(state)?
                .index()
                .get(key)
                .is_some_and(|entry| !is_expired(entry.expire_at, now)))
        })
    }

    /// Returns `true` if `key` holds a live value.
    pub fn contains(&self, key: &str) -> bool {
        self.report("contains", self.try_contains(key)).unwrap_or(false)
    }

    /// Returns every key, sorted. With `filter_expired`, expired keys that
    /// were not yet compacted away are left out.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn try_keys(&self, filter_expired: bool) -> CoreResult<Vec<String>> {
        self.read(|state| {
            let now = now_secs();
            let mut keys: Vec<String> = self
                .log(state)?
                .index()
                .iter()
                .filter(|(_, entry)| !filter_expired || !is_expired(entry.expire_at, now))
                .map(|(key, _)| key.clone())
                .collect();
            keys.sort_unstable();
            Ok(keys)
        })
    }

    /// Returns every key, sorted; empty on failure.
    pub fn keys(&self, filter_expired: bool) -> Vec<String> {
        self.report("keys", self.try_keys(filter_expired)).unwrap_or_default()
    }

    /// Returns the number of keys.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn try_count(&self, filter_expired: bool) -> CoreResult<usize> {
        self.read(|state| {
            let index = self.log(state)?.index();
            if !filter_expired {
                return Ok(index.len());
            }
            let now = now_secs();
            Ok(index.values().filter(|e| !is_expired(e.expire_at, now)).count())
        })
    }

    /// Returns the number of keys; 0 on failure.
    pub fn count(&self, filter_expired: bool) -> usize {
        self.report("count", self.try_count(filter_expired)).unwrap_or(0)
    }

    /// Returns the bytes used by the log, stale records included.
    pub fn actual_size(&self) -> u64 {
        self.report("actual_size", self.read(|state| Ok(self.log(state)?.header().actual_size)))
            .unwrap_or(0)
    }

    /// Returns the size of the backing file.
    pub fn total_size(&self) -> u64 {
        self.report("total_size", self.read(|state| Ok(self.log(state)?.capacity())))
            .unwrap_or(0)
    }

    /// Returns the log bytes held by overwritten and removed records.
    pub fn stale_bytes(&self) -> u64 {
        self.report("stale_bytes", self.read(|state| Ok(self.log(state)?.stale_bytes())))
            .unwrap_or(0)
    }

    /// Returns the encoded size of the value under `key`; 0 if absent.
    pub fn value_size(&self, key: &str) -> usize {
        let size = self.read(|state| {
            let record = self.log(state)?.live_record(key, now_secs())?;
            Ok(record.map_or(0, |r| r.value.len()))
        });
        self.report("value_size", size).unwrap_or(0)
    }

    /// Returns a copy of the authoritative header.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn try_header(&self) -> CoreResult<Header> {
        self.read(|state| Ok(self.log(state)?.header().clone()))
    }

    // --- settings ---------------------------------------------------------

    /// Gives every later write without an explicit TTL an expiry of
    /// `default_ttl_secs` seconds. `0` means no default expiry.
    pub fn enable_auto_key_expire(&self, default_ttl_secs: u32) -> bool {
        self.state.write().auto_expire = Some(default_ttl_secs);
        debug!(id = %self.id, default_ttl_secs, "auto key expiry enabled");
        true
    }

    /// Stops attaching a default expiry to later writes. Existing expiries
    /// are kept.
    pub fn disable_auto_key_expire(&self) -> bool {
        self.state.write().auto_expire = None;
        true
    }

    /// Skips writes whose value equals the stored one.
    pub fn enable_compare_before_set(&self) -> bool {
        self.state.write().compare_before_set = true;
        true
    }

    /// Always appends on write.
    pub fn disable_compare_before_set(&self) -> bool {
        self.state.write().compare_before_set = false;
        true
    }

    // --- maintenance ------------------------------------------------------

    /// Flushes the mapped file to disk.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or an I/O failure.
    pub fn try_sync(&self) -> CoreResult<()> {
        let state = self.state.read();
        self.log(&state)?.flush()
    }

    /// Flushes the mapped file to disk. Returns `false` on failure.
    pub fn sync(&self) -> bool {
        self.report("sync", self.try_sync()).is_some()
    }

    /// Reloads if another process changed the store, returning `true` if it
    /// did. The content-change handler runs for a detected change.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn try_check_content_changed(&self) -> CoreResult<bool> {
        self.ensure_open()?;
        let changed = loop {
            let file = self.file_lock(LockKind::Shared)?;
            let mut state = self.state.write();
            match self.refresh(&mut state, LockKind::Shared)? {
                Refresh::Repair => {
                    drop(state);
                    drop(file);
                    self.repair()?;
                }
                refreshed => break refreshed.sequence(),
            }
        };
        let detected = changed.is_some();
        if let Some(sequence) = changed {
            self.notify_external(sequence);
        }
        Ok(detected)
    }

    /// Reloads if another process changed the store.
    pub fn check_content_changed(&self) -> bool {
        self.report("check_content_changed", self.try_check_content_changed())
            .unwrap_or(false)
    }

    /// Drops the in-memory index; the next operation reloads it.
    pub fn clear_memory_cache(&self) {
        let mut state = self.state.write();
        if let Some(log) = state.log.as_mut() {
            log.forget();
            debug!(id = %self.id, "memory cache cleared");
        }
    }

    /// Flushes and unmaps the store. Every later operation fails with
    /// [`CoreError::StoreClosed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the final flush fails; the store is closed anyway.
    pub fn close(&self) -> CoreResult<()> {
        let log = self.state.write().log.take();
        match log {
            Some(log) => {
                let flushed = log.flush();
                drop(log);
                info!(id = %self.id, "closed store");
                flushed
            }
            None => Ok(()),
        }
    }

    /// Copies the backing file to `dst` while holding the shared lock.
    pub(crate) fn copy_file_to(&self, dst: &Path) -> CoreResult<u64> {
        self.read(|_| copy_atomic(&self.paths.data_path(), dst))
    }

    /// Replaces the whole content with `content`, a run of plaintext
    /// records, so the new sequence exceeds `min_sequence`.
    pub(crate) fn replace_content(&self, content: Vec<u8>, min_sequence: u64) -> CoreResult<()> {
        let sequence = self.write(|state| {
            let log = self.log_mut(state)?;
            log.replace_plain(content, min_sequence)?;
            Ok(log.header().sequence)
        })?;
        self.feed.emit(ContentChange {
            store_id: self.id.clone(),
            sequence,
            origin: ChangeOrigin::Restore,
        });
        Ok(())
    }

    /// Returns the crypt key in use, for decrypting backups.
    pub(crate) fn with_crypt_key<T>(&self, f: impl FnOnce(Option<&CryptKey>) -> T) -> CoreResult<T> {
        let state = self.state.read();
        Ok(f(self.log(&state)?.crypt_key()))
    }

    // --- cross-process lock -----------------------------------------------

    /// Takes the exclusive file lock so a group of operations runs without
    /// another process reading or writing in between.
    ///
    /// Re-entrant: every call needs a matching [`Store::unlock`]. Threads of
    /// this process are not held back. Single-process stores have no file
    /// lock and return at once.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or a lock timeout.
    pub fn lock(&self) -> CoreResult<()> {
        self.ensure_open()?;
        match &self.lock {
            Some(lock) => lock.lock(LockKind::Exclusive),
            None => Ok(()),
        }
    }

    /// Releases one hold taken by [`Store::lock`] or [`Store::try_lock`].
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to release the lock.
    pub fn unlock(&self) -> CoreResult<()> {
        match &self.lock {
            Some(lock) => lock.unlock(LockKind::Exclusive),
            None => Ok(()),
        }
    }

    /// Like [`Store::lock`] but returns `Ok(false)` instead of waiting.
    ///
    /// # Errors
    ///
    /// Returns an error for a closed store or an I/O failure.
    pub fn try_lock(&self) -> CoreResult<bool> {
        self.ensure_open()?;
        match &self.lock {
            Some(lock) => lock.try_lock(LockKind::Exclusive),
            None => Ok(true),
        }
    }

    // --- protocol ---------------------------------------------------------

    fn file_lock(&self, kind: LockKind) -> CoreResult<LockGuard<'_>> {
        match &self.lock {
            Some(lock) => lock.guard(kind),
            None => Ok(LockGuard::none(kind)),
        }
    }

    fn ensure_open(&self) -> CoreResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(CoreError::StoreClosed { id: self.id.clone() })
        }
    }

    fn log<'a>(&self, state: &'a StoreState) -> CoreResult<&'a AppendLog> {
        state
            .log
            .as_ref()
            .ok_or_else(|| CoreError::StoreClosed { id: self.id.clone() })
    }

    fn log_mut<'a>(&self, state: &'a mut StoreState) -> CoreResult<&'a mut AppendLog> {
        state
            .log
            .as_mut()
            .ok_or_else(|| CoreError::StoreClosed { id: self.id.clone() })
    }

    fn read<T>(&self, op: impl FnOnce(&StoreState) -> CoreResult<T>) -> CoreResult<T> {
        let (result, changed) = loop {
            let file = self.file_lock(LockKind::Shared)?;
            let state = self.state.read();
            if !self.log(&state)?.is_stale()? {
                break (op(&*state), None);
            }
            drop(state);
            let mut state = self.state.write();
            match self.refresh(&mut state, LockKind::Shared)? {
                Refresh::Repair => {
                    drop(state);
                    drop(file);
                    self.repair()?;
                }
                refreshed => {
                    let state = RwLockWriteGuard::downgrade(state);
                    break (op(&*state), refreshed.sequence());
                }
            }
        };
        if let Some(sequence) = changed {
            self.notify_external(sequence);
        }
        result
    }

    fn write<T>(&self, op: impl FnOnce(&mut StoreState) -> CoreResult<T>) -> CoreResult<T> {
        if !self.mode.is_writable() {
            return Err(CoreError::ReadOnly { id: self.id.clone() });
        }
        let (result, changed) = {
            let _file = self.file_lock(LockKind::Exclusive)?;
            let mut state = self.state.write();
            let changed = self.refresh(&mut state, LockKind::Exclusive)?.sequence();
            if state.pending_reset {
                let aside = self.paths.damaged_path();
                copy_atomic(&self.paths.data_path(), &aside)?;
                warn!(id = %self.id, path = %aside.display(), "damaged file set aside before reset");
                self.log_mut(&mut state)?.reset()?;
                state.pending_reset = false;
            }
            let result = op(&mut *state);
            if let Some(log) = state.log.as_ref() {
                state.loaded_sequence = log.header().sequence;
            }
            (result, changed)
        };
        if let Some(sequence) = changed {
            self.notify_external(sequence);
        }
        result
    }

    /// Reloads if the file changed since the last load.
    ///
    /// Damage found under the shared lock of a writable store is not
    /// settled here: the log is forgotten and [`Refresh::Repair`] tells the
    /// caller to release both locks and call [`Store::repair`].
    fn refresh(&self, state: &mut StoreState, held: LockKind) -> CoreResult<Refresh> {
        let log = self.log_mut(state)?;
        if !log.is_stale()? {
            return Ok(Refresh::Current);
        }
        let damage = log.reload()?;
        self.stats.record_reload();

        if damage.is_some() && held == LockKind::Shared && self.mode.is_writable() {
            log.forget();
            debug!(id = %self.id, "damage found under shared lock, deferring repair");
            return Ok(Refresh::Repair);
        }
        self.settle(state, damage)?;

        let sequence = self.log(state)?.header().sequence;
        let changed = sequence != state.loaded_sequence;
        state.loaded_sequence = sequence;
        if changed {
            debug!(id = %self.id, sequence, "reloaded after external change");
            Ok(Refresh::Changed(sequence))
        } else {
            Ok(Refresh::Current)
        }
    }

    /// Reloads and settles damage under the exclusive lock.
    fn repair(&self) -> CoreResult<()> {
        let changed = {
            let _file = self.file_lock(LockKind::Exclusive)?;
            let mut state = self.state.write();
            self.refresh(&mut state, LockKind::Exclusive)?.sequence()
        };
        if let Some(sequence) = changed {
            self.notify_external(sequence);
        }
        Ok(())
    }

    /// Applies the error policy for `damage`, if any.
    fn settle(&self, state: &mut StoreState, damage: Option<ErrorKind>) -> CoreResult<()> {
        state.pending_reset = false;
        let Some(kind) = damage else {
            return Ok(());
        };
        self.stats.record_error();
        let policy = self.handlers.on_error(&self.id, kind);
        let writable = self.mode.is_writable();
        warn!(id = %self.id, ?kind, ?policy, "store content damaged");

        let log = self.log_mut(state)?;
        match policy {
            ErrorPolicy::Discard if writable => log.reset()?,
            ErrorPolicy::Recover if writable => log.recover()?,
            // Read-only: the replayed prefix is already indexed.
            ErrorPolicy::Recover => return Ok(()),
            ErrorPolicy::Discard | ErrorPolicy::Keep => {
                log.drop_index();
                state.pending_reset = writable;
                return Ok(());
            }
        }
        let sequence = log.header().sequence;
        self.feed.emit(ContentChange {
            store_id: self.id.clone(),
            sequence,
            origin: ChangeOrigin::Recovery,
        });
        Ok(())
    }

    fn notify_external(&self, sequence: u64) {
        self.handlers.on_content_changed(&self.id);
        self.feed.emit(ContentChange {
            store_id: self.id.clone(),
            sequence,
            origin: ChangeOrigin::External,
        });
    }

    fn report<T>(&self, op: &'static str, result: CoreResult<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.stats.record_error();
                if e.is_lock_timeout() {
                    warn!(id = %self.id, op, error = %e, "operation timed out");
                } else {
                    error!(id = %self.id, op, error = %e, "operation failed");
                }
                None
            }
        }
    }
}

/// Outcome of [`Store::refresh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Refresh {
    /// The index matches the file.
    Current,
    /// Reloaded; the file now has this sequence.
    Changed(u64),
    /// Damage needs the exclusive lock to settle.
    Repair,
}

impl Refresh {
    const fn sequence(self) -> Option<u64> {
        match self {
            Self::Changed(sequence) => Some(sequence),
            Self::Current | Self::Repair => None,
        }
    }
}

fn check_key(key: &str) -> CoreResult<()> {
    if key.is_empty() {
        return Err(CoreError::invalid_argument("key must not be empty"));
    }
    check_length(key.len()).map_err(|e| CoreError::invalid_argument(format!("key: {e}")))
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("encrypted", &self.encrypted)
            .field("feed", &self.feed)
            .field("is_open", &self.is_open())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn options(mode: Mode) -> StoreOptions {
        StoreOptions {
            mode,
            crypt_key: None,
            expected_capacity: 0,
        }
    }

    fn open_in(dir: &TempDir, id: &str, mode: Mode, handlers: Arc<Handlers>) -> Store {
        let paths = StorePaths::for_id(dir.path(), id).unwrap();
        let config = Config::default().lock_timeout(Some(Duration::from_secs(2)));
        Store::open(id, paths, options(mode), &config, handlers).unwrap()
    }

    fn open_store(dir: &TempDir, mode: Mode) -> Store {
        open_in(dir, "test", mode, Arc::new(Handlers::new()))
    }

    #[test]
    fn set_get_remove() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);

        assert!(store.set("flag", true));
        assert!(store.set("n", -7i32));
        assert!(store.set("name", "mapkv"));
        assert!(store.get_bool("flag", false));
        assert_eq!(store.get_i32("n", 0), -7);
        assert_eq!(store.get_string("name", ""), "mapkv");
        assert_eq!(store.count(false), 3);

        assert!(store.remove("n"));
        assert!(!store.contains("n"));
        assert_eq!(store.get_i32("n", 42), 42);
        assert_eq!(store.keys(false), vec!["flag".to_string(), "name".to_string()]);
    }

    #[test]
    fn type_mismatch_returns_default() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        store.set("s", "text");
        assert_eq!(store.get_i64("s", 5), 5);
        assert_eq!(store.get_bytes("s", b"x"), b"x".to_vec());
        assert_eq!(store.value_size("s"), encode_value(&Value::from("text")).len());
        assert_eq!(store.value_size("missing"), 0);
    }

    #[test]
    fn empty_key_is_rejected() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        assert!(store.try_set("", 1u32).is_err());
        assert!(!store.set("", 1u32));
        assert_eq!(store.stats().errors(), 1);
    }

    #[test]
    fn oversized_value_is_rejected_before_writing() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        let limit = usize::try_from(mapkv_codec::MAX_BYTES_LENGTH).unwrap();
        let used = store.actual_size();
        let err = store.try_set("blob", Value::Bytes(vec![0; limit + 1])).unwrap_err();
        assert!(matches!(err, CoreError::InvalidArgument { .. }));
        assert!(!store.set("blob", Value::Bytes(vec![0; limit + 1])));
        assert!(!store.contains("blob"));
        assert_eq!(store.actual_size(), used);
        assert!(store.set("blob", Value::Bytes(vec![1; 16])));
    }

    #[test]
    fn values_survive_reopen() {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir, Mode::SingleProcess);
            store.set("list", Value::StrList(vec!["a".into(), "b".into()]));
            store.set("big", u64::MAX);
            store.close().unwrap();
        }
        let store = open_store(&dir, Mode::SingleProcess);
        assert_eq!(store.get_u64("big", 0), u64::MAX);
        assert_eq!(store.get_string_list("list", &[]), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn compare_before_set_keeps_size() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        store.enable_compare_before_set();
        assert!(store.try_set("k", 10u32).unwrap());
        let size = store.actual_size();
        assert!(!store.try_set("k", 10u32).unwrap());
        assert_eq!(store.actual_size(), size);
        assert!(store.try_set("k", 11u32).unwrap());
        assert!(store.actual_size() > size);

        store.disable_compare_before_set();
        let size = store.actual_size();
        assert!(store.try_set("k", 11u32).unwrap());
        assert!(store.actual_size() > size);
    }

    #[test]
    fn ttl_zero_overrides_auto_expire() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        store.enable_auto_key_expire(1);
        store.set_with_ttl("forever", 1u32, 0);
        store.set("short", 2u32);
        std::thread::sleep(Duration::from_millis(2100));

        assert!(store.contains("forever"));
        assert!(!store.contains("short"));
        assert_eq!(store.count(false), 2);
        assert_eq!(store.count(true), 1);
        assert_eq!(store.keys(true), vec!["forever".to_string()]);
    }

    #[test]
    fn closed_store_rejects_operations() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        store.set("k", 1u32);
        store.close().unwrap();
        assert!(!store.is_open());
        assert!(matches!(store.try_get_value("k"), Err(CoreError::StoreClosed { .. })));
        assert!(!store.set("k", 2u32));
        store.close().unwrap();
    }

    #[test]
    fn read_only_requires_existing_file() {
        let dir = tempdir().unwrap();
        let paths = StorePaths::for_id(dir.path(), "absent").unwrap();
        let result = Store::open(
            "absent",
            paths,
            options(Mode::ReadOnly),
            &Config::default(),
            Arc::new(Handlers::new()),
        );
        assert!(matches!(result, Err(CoreError::StorageNotFound { .. })));

        let writer = open_store(&dir, Mode::MultiProcess);
        writer.set("k", 1u32);
        let reader = open_store(&dir, Mode::ReadOnly);
        assert_eq!(reader.get_u32("k", 0), 1);
        assert!(matches!(reader.try_set("k", 2u32), Err(CoreError::ReadOnly { .. })));
    }

    #[test]
    fn second_handle_sees_changes() {
        let dir = tempdir().unwrap();
        let seen = Arc::new(parking_lot::Mutex::new(0));
        let handlers = Arc::new(Handlers::new());
        let counter = Arc::clone(&seen);
        handlers.set_content_change_handler(Some(Arc::new(move |_| *counter.lock() += 1)));

        let a = open_in(&dir, "shared", Mode::MultiProcess, Arc::new(Handlers::new()));
        let b = open_in(&dir, "shared", Mode::MultiProcess, handlers);
        let events = b.subscribe();

        a.set("k", 1u32);
        assert_eq!(b.get_u32("k", 0), 1);
        assert_eq!(*seen.lock(), 1);
        assert_eq!(events.try_recv().unwrap().origin, ChangeOrigin::External);

        // Growth in one handle is picked up by the other.
        for i in 0..500 {
            a.set(&format!("key-{i}"), vec![7u8; 64]);
        }
        assert_eq!(b.count(false), 501);
        assert_eq!(b.total_size(), a.total_size());

        b.remove("k");
        assert!(!a.contains("k"));
        assert!(!b.check_content_changed());
    }

    #[test]
    fn store_lock_is_reentrant_and_local_writes_pass() {
        let dir = tempdir().unwrap();
        let a = open_in(&dir, "shared", Mode::MultiProcess, Arc::new(Handlers::new()));
        let b = open_in(&dir, "shared", Mode::MultiProcess, Arc::new(Handlers::new()));
        a.lock().unwrap();
        a.lock().unwrap();
        assert!(a.set("k", 1u32));
        assert!(!b.try_lock().unwrap());
        a.unlock().unwrap();
        assert!(!b.try_lock().unwrap());
        a.unlock().unwrap();
        assert!(b.try_lock().unwrap());
        assert_eq!(b.get_u32("k", 0), 1);
        b.unlock().unwrap();

        let single = open_store(&dir, Mode::SingleProcess);
        single.lock().unwrap();
        assert!(single.try_lock().unwrap());
        single.unlock().unwrap();
        single.close().unwrap();
        assert!(matches!(single.lock(), Err(CoreError::StoreClosed { .. })));
    }

    #[test]
    fn clear_memory_cache_reloads_silently() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        let events = store.subscribe();
        store.set("k", 3u32);
        store.clear_memory_cache();
        assert_eq!(store.get_u32("k", 0), 3);
        assert!(events.try_recv().is_err());
    }

    #[test]
    fn clear_all_and_trim() {
        let dir = tempdir().unwrap();
        let store = open_store(&dir, Mode::SingleProcess);
        for i in 0..300 {
            store.set(&format!("k{i}"), vec![1u8; 100]);
        }
        let grown = store.total_size();
        assert!(grown > 4096);
        let keys: Vec<String> = (1..300).map(|i| format!("k{i}")).collect();
        assert!(store.remove_many(&keys));
        assert!(store.trim());
        assert!(store.total_size() < grown);
        assert_eq!(store.count(false), 1);

        assert!(store.clear_all());
        assert_eq!(store.count(false), 0);
        assert_eq!(store.total_size(), 4096);
        assert_eq!(store.actual_size(), 0);
    }

    fn corrupt_first_record(dir: &TempDir) {
        let path = StorePaths::for_id(dir.path(), "test").unwrap().data_path();
        let mut bytes = std::fs::read(&path).unwrap();
        bytes[HEADER_SIZE as usize + 6] ^= 0xFF;
        std::fs::write(&path, bytes).unwrap();
    }

    fn damaged_store(policy: ErrorPolicy) -> (TempDir, Store) {
        let dir = tempdir().unwrap();
        {
            let store = open_store(&dir, Mode::SingleProcess);
            store.set("a", 1u32);
            store.set("b", 2u32);
        }
        corrupt_first_record(&dir);
        let handlers = Arc::new(Handlers::new());
        handlers.set_error_handler(Some(Arc::new(move |_, _| policy)));
        let store = open_in(&dir, "test", Mode::SingleProcess, handlers);
        (dir, store)
    }

    #[test]
    fn discard_policy_empties_store() {
        let (_dir, store) = damaged_store(ErrorPolicy::Discard);
        assert_eq!(store.count(false), 0);
        assert_eq!(store.actual_size(), 0);
        assert_eq!(store.stats().errors(), 1);
    }

    #[test]
    fn keep_policy_sets_damaged_file_aside_before_first_write() {
        let (dir, store) = damaged_store(ErrorPolicy::Keep);
        assert_eq!(store.count(false), 0);
        assert!(store.actual_size() > 0);
        drop(store);

        // Still damaged on disk, so the next open reports it again.
        let handlers = Arc::new(Handlers::new());
        handlers.set_error_handler(Some(Arc::new(|_, _| ErrorPolicy::Keep)));
        let store = open_in(&dir, "test", Mode::SingleProcess, handlers);
        assert_eq!(store.stats().errors(), 1);

        let paths = StorePaths::for_id(dir.path(), "test").unwrap();
        let damaged = std::fs::read(paths.data_path()).unwrap();
        assert!(!paths.damaged_path().exists());

        store.set("c", 3u32);
        assert_eq!(store.keys(false), vec!["c".to_string()]);
        assert_eq!(std::fs::read(paths.damaged_path()).unwrap(), damaged);
    }
}
