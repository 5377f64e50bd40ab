//! Backup, restore and verification of store files.
//!
//! A backup is a byte-for-byte copy of `<stem>.mkv` taken under the shared
//! lock, so it always holds a committed header and its log. Restoring
//! validates the copy completely before the target is touched:
//!
//! 1. a header slot must validate
//! 2. the log range must fit the file
//! 3. the content checksum must match
//!
//! A store open in this process receives the backup's records through its
//! own publish path (decrypting with the backup's salt and nonce and
//! re-encrypting with its own). A store nobody here has open receives the
//! raw log bytes and adopts the backup's encryption fields. Either way the
//! new sequence exceeds both the old and the backup sequence, so other
//! processes reload.

use crate::config::Config;
use crate::crypto::{CryptKey, DerivedKey};
use crate::error::{CoreError, CoreResult};
use crate::header::{read_header, Header, HeaderState};
use crate::layout::{copy_atomic, StorePaths};
use crate::lock::{LockKind, ProcessLock};
use crate::log::{replay_records, AppendLog};
use crate::stats::StoreStats;
use crate::store::Store;
use mapkv_storage::{MappedRegion, PAGE_SIZE};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A validated store file loaded into memory.
#[derive(Debug, Clone)]
pub(crate) struct BackupImage {
    /// Authoritative header of the file.
    pub header: Header,
    /// On-disk log bytes, still encrypted if the store is.
    pub disk: Vec<u8>,
}

impl BackupImage {
    /// Reads and validates the store file at `path`.
    pub(crate) fn load(id: &str, path: &Path) -> CoreResult<Self> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(CoreError::storage_not_found(id));
            }
            Err(e) => return Err(e.into()),
        };
        let header = match read_header(&bytes) {
            HeaderState::Valid(header) => header,
            HeaderState::Blank => {
                return Err(CoreError::corrupt_data(format!("backup of {id} was never committed")));
            }
            HeaderState::Damaged => {
                return Err(CoreError::corrupt_data(format!("backup of {id} has no valid header")));
            }
        };

        let start = header.log_start as usize;
        let end = header.log_end();
        if end > bytes.len() as u64 {
            return Err(CoreError::corrupt_data(format!(
                "backup of {id} is truncated: log ends at {end}, file has {} bytes",
                bytes.len()
            )));
        }
        let disk = bytes[start..end as usize].to_vec();
        let actual = crc32fast::hash(&disk);
        if actual != header.content_crc {
            return Err(CoreError::ChecksumMismatch {
                expected: header.content_crc,
                actual,
            });
        }
        Ok(Self { header, disk })
    }

    /// Returns the log as plaintext records.
    ///
    /// A plain backup needs no key; an encrypted one needs the key it was
    /// written with.
    pub(crate) fn plaintext(&self, id: &str, key: Option<&CryptKey>) -> CoreResult<Vec<u8>> {
        if !self.header.encrypted {
            return Ok(self.disk.clone());
        }
        let Some(key) = key else {
            return Err(CoreError::CryptStateMismatch {
                id: id.to_string(),
                encrypted: true,
            });
        };
        let derived = DerivedKey::derive(key, &self.header.salt)?;
        if !derived.matches(&self.header.key_check) {
            return Err(CoreError::InvalidCryptKey { id: id.to_string() });
        }
        let mut plain = self.disk.clone();
        derived.cipher(self.header.nonce).apply(0, &mut plain);
        Ok(plain)
    }
}

/// Copies a live store's file into `dst_dir`.
pub(crate) fn backup_live(store: &Store, dst_dir: &Path) -> CoreResult<PathBuf> {
    std::fs::create_dir_all(dst_dir)?;
    let dst = StorePaths::for_stem(dst_dir, store.paths().stem()).data_path();
    let bytes = store.copy_file_to(&dst)?;
    info!(id = store.id(), dst = %dst.display(), bytes, "backed up store");
    Ok(dst)
}

/// Copies the file of a store nobody in this process has open.
pub(crate) fn backup_file(paths: &StorePaths, dst_dir: &Path, config: &Config) -> CoreResult<PathBuf> {
    if !paths.exists() {
        return Err(CoreError::storage_not_found(paths.stem()));
    }
    std::fs::create_dir_all(dst_dir)?;
    let dst = StorePaths::for_stem(dst_dir, paths.stem()).data_path();
    let lock = ProcessLock::open(paths.stem(), &paths.lock_path(), config.lock_timeout)?;
    let _guard = lock.guard(LockKind::Shared)?;
    let bytes = copy_atomic(&paths.data_path(), &dst)?;
    info!(stem = paths.stem(), dst = %dst.display(), bytes, "backed up store file");
    Ok(dst)
}

/// Restores `image` into a live store.
pub(crate) fn restore_live(store: &Store, image: &BackupImage) -> CoreResult<()> {
    let plain = store.with_crypt_key(|key| image.plaintext(store.id(), key))??;
    store.replace_content(plain, image.header.sequence)?;
    info!(id = store.id(), sequence = image.header.sequence, "restored store from backup");
    Ok(())
}

/// Restores `image` into the file at `paths`, creating it if needed.
pub(crate) fn restore_file(paths: &StorePaths, image: &BackupImage, config: &Config) -> CoreResult<()> {
    std::fs::create_dir_all(paths.root())?;
    let lock = ProcessLock::open(paths.stem(), &paths.lock_path(), config.lock_timeout)?;
    let _guard = lock.guard(LockKind::Exclusive)?;

    let region = MappedRegion::open(&paths.data_path(), PAGE_SIZE)?;
    let mut log = AppendLog::open_raw(
        paths.stem(),
        Box::new(region),
        config.sync_on_write,
        Arc::new(StoreStats::new()),
    )?;
    log.replace_raw(&image.header, &image.disk)?;
    log.flush()?;
    info!(stem = paths.stem(), sequence = log.header().sequence, "restored store file from backup");
    Ok(())
}

/// Result of checking one store file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifyReport {
    /// File that was checked.
    pub path: PathBuf,
    /// File length in bytes.
    pub file_len: u64,
    /// Authoritative header, if a slot validated.
    pub header: Option<Header>,
    /// Whether the log range fits inside the file.
    pub length_ok: bool,
    /// Whether the content checksum matched.
    pub content_crc_ok: bool,
    /// Records that decoded, or `None` for an encrypted file checked
    /// without its key.
    pub records: Option<usize>,
    /// Distinct live keys among those records.
    pub live_keys: Option<usize>,
    /// Log bytes covered by the decoded records.
    pub valid_bytes: Option<u64>,
}

impl VerifyReport {
    /// Returns `true` if every check passed.
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let records_ok = match (&self.header, self.valid_bytes) {
            (Some(header), Some(valid)) => valid == header.actual_size,
            (Some(_), None) => true,
            (None, _) => false,
        };
        self.length_ok && self.content_crc_ok && records_ok
    }
}

/// Checks the header slots, content checksum and record checksums of the
/// store file at `path` without opening it as a store.
///
/// # Errors
///
/// Returns an error if the file cannot be read or `key` is wrong for an
/// encrypted file.
pub fn verify_file(path: &Path, key: Option<&CryptKey>) -> CoreResult<VerifyReport> {
    let bytes = std::fs::read(path)?;
    let mut report = VerifyReport {
        path: path.to_path_buf(),
        file_len: bytes.len() as u64,
        header: None,
        length_ok: false,
        content_crc_ok: false,
        records: None,
        live_keys: None,
        valid_bytes: None,
    };
    let HeaderState::Valid(header) = read_header(&bytes) else {
        return Ok(report);
    };
    report.header = Some(header.clone());
    report.length_ok = header.log_end() <= report.file_len;
    if !report.length_ok {
        return Ok(report);
    }

    let disk = &bytes[header.log_start as usize..header.log_end() as usize];
    report.content_crc_ok = crc32fast::hash(disk) == header.content_crc;

    if header.encrypted && key.is_none() {
        return Ok(report);
    }
    let image = BackupImage {
        header,
        disk: disk.to_vec(),
    };
    let plain = image.plaintext(&path.display().to_string(), key)?;
    let mut records = 0;
    let mut live = HashSet::new();
    let valid = replay_records(&plain, |record, _, _| {
        records += 1;
        if record.is_tombstone() {
            live.remove(&record.key);
        } else {
            live.insert(record.key.clone());
        }
    });
    debug!(path = %path.display(), records, valid, "verified store file");
    report.records = Some(records);
    report.live_keys = Some(live.len());
    report.valid_bytes = Some(valid);
    Ok(report)
}
