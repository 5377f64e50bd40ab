//! Append log and in-memory index.
//!
//! The log occupies `[log_start, log_start + actual_size)` of the region.
//! Every mutation appends one record, then commits a header slot carrying
//! the new size, so a crash leaves either the old or the new state visible.
//! Index offsets are relative to `log_start`, which is also the keystream
//! position of each record when the store is encrypted; moving the log as
//! a block therefore never invalidates either.
//!
//! Rewrites of the whole log (compaction, restore) go through a two-phase
//! publish: the new content is written past the current tail and committed
//! there first, then copied to the front and committed again.

use crate::compaction::{self, CompactionPolicy, CompactionResult};
use crate::crypto::{random_nonce, random_salt, CryptKey, DerivedKey, LogCipher};
use crate::error::{CoreError, CoreResult};
use crate::expiry::{is_expired, now_secs};
use crate::handlers::ErrorKind;
use crate::header::{peek_sequence, read_header, Header, HeaderState, HEADER_SIZE, SLOT_SIZE};
use crate::record::Record;
use crate::stats::StoreStats;
use mapkv_storage::{round_to_page, Region, PAGE_SIZE};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Location of a key's newest record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset relative to the log start.
    pub offset: u64,
    /// Encoded record length.
    pub len: u32,
    /// Absolute expiry, if any.
    pub expire_at: Option<u64>,
}

/// The append log of one store.
pub(crate) struct AppendLog {
    id: String,
    region: Box<dyn Region>,
    header: Header,
    crypt_key: Option<CryptKey>,
    derived: Option<DerivedKey>,
    cipher: Option<LogCipher>,
    index: HashMap<String, IndexEntry>,
    stale_bytes: u64,
    /// Length of the log prefix that replayed cleanly.
    valid_prefix: u64,
    /// Sequence read from disk at the last load; `None` if the header was damaged.
    seen_sequence: Option<u64>,
    header_lost: bool,
    sync_on_write: bool,
    stats: Arc<StoreStats>,
}

impl AppendLog {
    /// Opens the log stored in `region`.
    ///
    /// A blank region is initialized (and committed when `writable`).
    /// Damaged content does not fail the open: the log comes back with
    /// whatever replayed cleanly and the kind of damage, and the caller
    /// decides between [`AppendLog::reset`], [`AppendLog::recover`] and
    /// keeping it untouched.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures and for a missing, superfluous or
    /// wrong crypt key.
    pub(crate) fn open(
        id: &str,
        region: Box<dyn Region>,
        crypt_key: Option<CryptKey>,
        sync_on_write: bool,
        writable: bool,
        stats: Arc<StoreStats>,
    ) -> CoreResult<(Self, Option<ErrorKind>)> {
        let state = read_header(region.read(0, HEADER_SIZE as usize)?);
        let mut log = Self::detached(id, region, crypt_key, sync_on_write, stats);

        match state {
            HeaderState::Blank => {
                debug!(id, "initializing new store file");
                log.init_fresh_header()?;
                if writable {
                    log.commit()?;
                }
                log.seen_sequence = log.disk_sequence()?;
                Ok((log, None))
            }
            HeaderState::Damaged => {
                warn!(id, "no valid header slot");
                log.init_fresh_header()?;
                log.header_lost = true;
                Ok((log, Some(ErrorKind::CrcMismatch)))
            }
            HeaderState::Valid(header) => {
                log.header = header;
                log.seen_sequence = Some(log.header.sequence);
                log.bind_key()?;
                let damage = log.load_index()?;
                Ok((log, damage))
            }
        }
    }

    /// Attaches to `region` without binding a key or replaying records.
    ///
    /// Only [`AppendLog::replace_raw`] is meaningful on the result; it is
    /// how a backup is restored into a store nobody in this process has
    /// open, whatever its encryption state.
    pub(crate) fn open_raw(
        id: &str,
        region: Box<dyn Region>,
        sync_on_write: bool,
        stats: Arc<StoreStats>,
    ) -> CoreResult<Self> {
        let state = read_header(region.read(0, HEADER_SIZE as usize)?);
        let mut log = Self::detached(id, region, None, sync_on_write, stats);
        if let HeaderState::Valid(header) = state {
            log.seen_sequence = Some(header.sequence);
            log.header = header;
        }
        Ok(log)
    }

    fn detached(
        id: &str,
        region: Box<dyn Region>,
        crypt_key: Option<CryptKey>,
        sync_on_write: bool,
        stats: Arc<StoreStats>,
    ) -> Self {
        Self {
            id: id.to_string(),
            header: Header::new(region.len()),
            region,
            crypt_key,
            derived: None,
            cipher: None,
            index: HashMap::new(),
            stale_bytes: 0,
            valid_prefix: 0,
            seen_sequence: None,
            header_lost: false,
            sync_on_write,
            stats,
        }
    }

    /// Re-reads the header and index after another process committed.
    ///
    /// # Errors
    ///
    /// Returns an error for I/O failures or a crypt key that no longer
    /// matches the file.
    pub(crate) fn reload(&mut self) -> CoreResult<Option<ErrorKind>> {
        if self.region.refresh()? {
            debug!(id = %self.id, len = self.region.len(), "remapped after external resize");
        }
        self.index.clear();
        self.stale_bytes = 0;
        self.valid_prefix = 0;

        match read_header(self.region.read(0, HEADER_SIZE as usize)?) {
            HeaderState::Valid(header) => {
                self.header = header;
                self.header_lost = false;
                self.seen_sequence = Some(self.header.sequence);
                self.bind_key()?;
                self.load_index()
            }
            HeaderState::Blank => {
                self.init_fresh_header()?;
                self.header_lost = false;
                self.seen_sequence = None;
                Ok(None)
            }
            HeaderState::Damaged => {
                warn!(id = %self.id, "no valid header slot after external change");
                self.init_fresh_header()?;
                self.header_lost = true;
                self.seen_sequence = None;
                Ok(Some(ErrorKind::CrcMismatch))
            }
        }
    }

    /// Returns the sequence of the authoritative header on disk.
    pub(crate) fn disk_sequence(&self) -> CoreResult<Option<u64>> {
        Ok(peek_sequence(self.region.read(0, HEADER_SIZE as usize)?))
    }

    /// Returns `true` if the file changed since this log last loaded it.
    pub(crate) fn is_stale(&self) -> CoreResult<bool> {
        Ok(self.disk_sequence()? != self.seen_sequence)
    }

    /// Returns the current header.
    pub(crate) fn header(&self) -> &Header {
        &self.header
    }

    /// Returns the file capacity.
    pub(crate) fn capacity(&self) -> u64 {
        self.region.len()
    }

    /// Returns the bytes held by overwritten, removed and tombstone records.
    pub(crate) fn stale_bytes(&self) -> u64 {
        self.stale_bytes
    }

    /// Returns the index.
    pub(crate) fn index(&self) -> &HashMap<String, IndexEntry> {
        &self.index
    }

    /// Returns the crypt key this log was opened with.
    pub(crate) fn crypt_key(&self) -> Option<&CryptKey> {
        self.crypt_key.as_ref()
    }

    /// Empties the in-memory index without touching the file or the
    /// loaded sequence.
    pub(crate) fn drop_index(&mut self) {
        self.index.clear();
        self.stale_bytes = 0;
    }

    /// Drops the in-memory index until the next reload.
    pub(crate) fn forget(&mut self) {
        self.index.clear();
        self.stale_bytes = 0;
        self.seen_sequence = None;
    }

    /// Reads and decodes the record behind `entry`.
    ///
    /// # Errors
    ///
    /// Returns an error if the bytes no longer decode.
    pub(crate) fn read_record(&self, entry: &IndexEntry) -> CoreResult<Record> {
        let plain = self.read_plain(entry)?;
        let (record, _) = Record::decode(&plain)?;
        Ok(record)
    }

    /// Returns the live record for `key`, skipping expired ones.
    pub(crate) fn live_record(&self, key: &str, now: u64) -> CoreResult<Option<Record>> {
        match self.index.get(key) {
            Some(entry) if !is_expired(entry.expire_at, now) => self.read_record(entry).map(Some),
            _ => Ok(None),
        }
    }

    fn read_plain(&self, entry: &IndexEntry) -> CoreResult<Vec<u8>> {
        let at = self.header.log_start + entry.offset;
        let mut bytes = self.region.read(at, entry.len as usize)?.to_vec();
        if let Some(cipher) = &self.cipher {
            cipher.apply(entry.offset, &mut bytes);
        }
        Ok(bytes)
    }

    /// Appends `record`, growing or compacting first if it does not fit.
    ///
    /// Returns the encoded record length.
    ///
    /// # Errors
    ///
    /// Returns an error if the record cannot be written or committed.
    pub(crate) fn append(&mut self, record: &Record, policy: &CompactionPolicy) -> CoreResult<u64> {
        let mut bytes = record.encode()?;
        let len = bytes.len() as u64;
        self.ensure_room(len, policy)?;

        let offset = self.header.actual_size;
        if let Some(cipher) = &self.cipher {
            cipher.apply(offset, &mut bytes);
        }
        let at = self.header.log_start + offset;
        self.region.write_at(at, &bytes)?;
        if self.sync_on_write {
            self.region.flush_range(at, bytes.len())?;
        }

        let mut hasher = crc32fast::Hasher::new_with_initial(self.header.content_crc);
        hasher.update(&bytes);
        self.header.content_crc = hasher.finalize();
        self.header.actual_size += len;
        self.commit()?;

        self.apply(record, offset, len);
        self.valid_prefix = self.header.actual_size;
        Ok(len)
    }

    /// Compacts when the stale share crosses the policy thresholds.
    ///
    /// Returns `true` if a compaction ran.
    ///
    /// # Errors
    ///
    /// Returns an error if the compaction fails.
    pub(crate) fn maybe_compact(&mut self, policy: &CompactionPolicy) -> CoreResult<bool> {
        if !policy.should_compact(self.stale_bytes, self.header.actual_size) {
            return Ok(false);
        }
        self.compact(0, policy)?;
        Ok(true)
    }

    /// Rewrites the log with only live, unexpired records.
    ///
    /// `reserve` is the size of a pending append that must fit afterwards.
    ///
    /// # Errors
    ///
    /// Returns an error if reading, writing or committing fails.
    pub(crate) fn compact(&mut self, reserve: u64, policy: &CompactionPolicy) -> CoreResult<CompactionResult> {
        let before = self.header.actual_size;
        let compacted = compaction::compact(&self.index, now_secs(), |entry| {
            self.read_plain(entry)
        })?;
        let result = compacted.result.clone();
        self.publish_plain(compacted.content, compacted.index)?;
        self.stats.record_compaction();
        info!(
            id = %self.id,
            before,
            after = self.header.actual_size,
            live = result.live_records,
            expired = result.expired_dropped,
            "compacted log"
        );

        // Keep appends amortized O(1): at least half the log area stays free.
        let wanted = self.header.actual_size + reserve;
        if wanted > policy.free_target(self.usable()) {
            self.grow(HEADER_SIZE + wanted.saturating_mul(2))?;
            self.commit()?;
        }
        Ok(result)
    }

    /// Compacts, then shrinks the file to the smallest page-rounded size
    /// holding the live data.
    ///
    /// # Errors
    ///
    /// Returns an error if compaction or resizing fails.
    pub(crate) fn trim(&mut self, policy: &CompactionPolicy) -> CoreResult<()> {
        if self.stale_bytes > 0 || self.header.log_start != HEADER_SIZE {
            self.compact(0, policy)?;
        }
        let target = round_to_page(self.header.log_end());
        if target < self.region.len() {
            info!(id = %self.id, from = self.region.len(), to = target, "trimming store file");
            self.region.resize(target)?;
            self.commit()?;
        }
        Ok(())
    }

    /// Empties the log and shrinks the file to `capacity` if it is larger.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit or resize fails.
    pub(crate) fn clear(&mut self, capacity: u64) -> CoreResult<()> {
        self.publish_plain(Vec::new(), HashMap::new())?;
        let capacity = round_to_page(capacity.max(HEADER_SIZE));
        if capacity < self.region.len() {
            self.region.resize(capacity)?;
            self.commit()?;
        }
        Ok(())
    }

    /// Discards all content, keeping the encryption state.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub(crate) fn reset(&mut self) -> CoreResult<()> {
        warn!(id = %self.id, "discarding store content");
        if self.header_lost {
            let sequence = self.header.sequence;
            self.init_fresh_header()?;
            self.header.sequence = sequence;
            self.header_lost = false;
        }
        self.index.clear();
        self.stale_bytes = 0;
        self.header.log_start = HEADER_SIZE;
        self.header.actual_size = 0;
        self.header.content_crc = 0;
        if self.header.encrypted {
            self.rekey_nonce(random_nonce());
        }
        self.commit_durable()?;
        self.valid_prefix = 0;
        self.seen_sequence = Some(self.header.sequence);
        Ok(())
    }

    /// Keeps the longest prefix of records that still validate.
    ///
    /// # Errors
    ///
    /// Returns an error if the commit fails.
    pub(crate) fn recover(&mut self) -> CoreResult<()> {
        if self.header_lost {
            if self.crypt_key.is_some() {
                warn!(id = %self.id, "encrypted log cannot be recovered without its header");
                return self.reset();
            }
            let sequence = self.header.sequence;
            self.init_fresh_header()?;
            self.header.sequence = sequence;
            self.header.actual_size = self.region.len() - HEADER_SIZE;
            self.index.clear();
            self.stale_bytes = 0;
            self.valid_prefix = self.replay(self.header.actual_size)?;
            self.header_lost = false;
        }

        let kept = self.valid_prefix;
        let at = self.header.log_start;
        if let Some(cipher) = &self.cipher {
            // The damaged tail was written under the current nonce; new
            // appends at the same offsets must not reuse its keystream.
            let mut plain = self.region.read(at, kept as usize)?.to_vec();
            cipher.apply(0, &mut plain);
            let index = std::mem::take(&mut self.index);
            let stale = self.stale_bytes;
            self.publish_plain(plain, index)?;
            self.stale_bytes = stale;
            warn!(id = %self.id, kept, keys = self.index.len(), "recovered valid record prefix under a fresh nonce");
            return Ok(());
        }
        self.header.actual_size = kept;
        self.header.content_crc = crc32fast::hash(self.region.read(at, kept as usize)?);
        self.commit_durable()?;
        self.seen_sequence = Some(self.header.sequence);
        warn!(id = %self.id, kept, keys = self.index.len(), "recovered valid record prefix");
        Ok(())
    }

    /// Replaces the whole log with `content`, a sequence of plaintext
    /// records, and makes the new sequence exceed `min_sequence`.
    ///
    /// # Errors
    ///
    /// Returns an error if `content` does not replay cleanly or cannot be
    /// published.
    pub(crate) fn replace_plain(&mut self, content: Vec<u8>, min_sequence: u64) -> CoreResult<()> {
        let mut index = HashMap::new();
        let mut stale = 0;
        let consumed = replay_records(&content, |record, offset, len| {
            apply_to(&mut index, &mut stale, record, offset, len);
        });
        if consumed != content.len() as u64 {
            return Err(CoreError::corrupt_data(format!(
                "replacement content invalid after {consumed} of {} bytes",
                content.len()
            )));
        }
        self.header.sequence = self.header.sequence.max(min_sequence);
        self.publish_plain(content, index)?;
        self.stale_bytes = stale;
        Ok(())
    }

    /// Replaces the whole log with raw on-disk bytes described by `source`,
    /// adopting its encryption fields, without interpreting the records.
    ///
    /// # Errors
    ///
    /// Returns an error if publishing fails.
    pub(crate) fn replace_raw(&mut self, source: &Header, disk: &[u8]) -> CoreResult<()> {
        let mut target = self.header.clone();
        target.encrypted = source.encrypted;
        target.salt = source.salt;
        target.nonce = source.nonce;
        target.key_check = source.key_check;
        self.header.sequence = self.header.sequence.max(source.sequence);
        self.publish_disk(disk, target)?;
        self.index.clear();
        self.stale_bytes = 0;
        Ok(())
    }

    /// Flushes the whole region.
    pub(crate) fn flush(&self) -> CoreResult<()> {
        self.region.flush()?;
        Ok(())
    }

    fn usable(&self) -> u64 {
        self.region.len().saturating_sub(HEADER_SIZE)
    }

    fn ensure_room(&mut self, need: u64, policy: &CompactionPolicy) -> CoreResult<()> {
        let required = self.header.log_end() + need;
        if required <= self.region.len() {
            return Ok(());
        }
        if self.stale_bytes > 0 {
            self.compact(need, policy)?;
            if self.header.log_end() + need <= self.region.len() {
                return Ok(());
            }
        }
        self.grow(self.header.log_end() + need)
    }

    /// Grows the region by doubling until `required` plus a reserve for
    /// future writes fits. The new capacity is committed with the next header.
    fn grow(&mut self, required: u64) -> CoreResult<()> {
        let target = required.saturating_add(self.future_reserve());
        let old = self.region.len();
        let mut capacity = old.max(PAGE_SIZE);
        while capacity < target {
            capacity = capacity.saturating_mul(2);
        }
        let capacity = round_to_page(capacity);
        if capacity <= old {
            return Ok(());
        }
        info!(id = %self.id, old, new = capacity, "growing store file");
        self.region.resize(capacity)?;
        self.stats.record_growth();
        Ok(())
    }

    fn future_reserve(&self) -> u64 {
        let count = self.index.len() as u64;
        if count == 0 {
            return 0;
        }
        let live = self.header.actual_size.saturating_sub(self.stale_bytes);
        let average = live / count;
        average.saturating_mul(count.div_ceil(2).max(8))
    }

    fn publish_plain(&mut self, mut content: Vec<u8>, index: HashMap<String, IndexEntry>) -> CoreResult<()> {
        let mut target = self.header.clone();
        let cipher = match &self.cipher {
            Some(cipher) => {
                let fresh = cipher.with_nonce(random_nonce());
                fresh.apply(0, &mut content);
                target.nonce = fresh.nonce();
                Some(fresh)
            }
            None => None,
        };
        self.publish_disk(&content, target)?;
        self.cipher = cipher;
        self.index = index;
        self.stale_bytes = 0;
        Ok(())
    }

    /// Two-phase publish of on-disk bytes. `target` supplies the
    /// encryption fields of the new log.
    fn publish_disk(&mut self, disk: &[u8], target: Header) -> CoreResult<()> {
        let len = disk.len() as u64;
        let crc = crc32fast::hash(disk);
        let with_content = |log_start: u64, sequence: u64| Header {
            log_start,
            actual_size: len,
            content_crc: crc,
            sequence,
            ..target.clone()
        };

        if len == 0 {
            self.header = with_content(HEADER_SIZE, self.header.sequence);
            self.commit_durable()?;
            self.valid_prefix = 0;
            self.seen_sequence = Some(self.header.sequence);
            return Ok(());
        }

        // Phase 1: stage past the current tail and past the final range.
        let scratch = align8(self.header.log_end().max(HEADER_SIZE + len));
        if scratch + len > self.region.len() {
            self.grow(scratch + len)?;
        }
        self.region.write_at(scratch, disk)?;
        self.region.flush_range(scratch, disk.len())?;
        self.header = with_content(scratch, self.header.sequence);
        self.commit_durable()?;

        // Phase 2: move to the front.
        self.region.copy_within(scratch, disk.len(), HEADER_SIZE)?;
        self.region.flush_range(HEADER_SIZE, disk.len())?;
        self.header.log_start = HEADER_SIZE;
        self.commit_durable()?;

        self.valid_prefix = len;
        self.seen_sequence = Some(self.header.sequence);
        debug!(id = %self.id, len, sequence = self.header.sequence, "published log");
        Ok(())
    }

    fn commit(&mut self) -> CoreResult<()> {
        self.write_header(self.sync_on_write)
    }

    fn commit_durable(&mut self) -> CoreResult<()> {
        self.write_header(true)
    }

    fn write_header(&mut self, flush: bool) -> CoreResult<()> {
        self.header.sequence += 1;
        self.header.capacity = self.region.len();
        let slot = self.header.encode();
        let at = self.header.slot_offset();
        self.region.write_at(at, &slot)?;
        if flush {
            self.region.flush_range(at, SLOT_SIZE)?;
        }
        self.seen_sequence = Some(self.header.sequence);
        Ok(())
    }

    fn init_fresh_header(&mut self) -> CoreResult<()> {
        self.header = Header::new(self.region.len());
        self.derived = None;
        self.cipher = None;
        if let Some(key) = &self.crypt_key {
            let salt = random_salt();
            let derived = DerivedKey::derive(key, &salt)?;
            self.header.encrypted = true;
            self.header.salt = salt;
            self.header.key_check = derived.check();
            self.derived = Some(derived);
            self.rekey_nonce(random_nonce());
        }
        Ok(())
    }

    fn rekey_nonce(&mut self, nonce: [u8; 16]) {
        self.header.nonce = nonce;
        self.cipher = self.derived.as_ref().map(|d| d.cipher(nonce));
    }

    fn bind_key(&mut self) -> CoreResult<()> {
        match (&self.crypt_key, self.header.encrypted) {
            (None, false) => {
                self.derived = None;
                self.cipher = None;
                Ok(())
            }
            (Some(_), false) | (None, true) => Err(CoreError::CryptStateMismatch {
                id: self.id.clone(),
                encrypted: self.header.encrypted,
            }),
            (Some(key), true) => {
                let derived = DerivedKey::derive(key, &self.header.salt)?;
                if !derived.matches(&self.header.key_check) {
                    return Err(CoreError::InvalidCryptKey { id: self.id.clone() });
                }
                self.cipher = Some(derived.cipher(self.header.nonce));
                self.derived = Some(derived);
                Ok(())
            }
        }
    }

    fn load_index(&mut self) -> CoreResult<Option<ErrorKind>> {
        self.index.clear();
        self.stale_bytes = 0;

        let file_len = self.region.len();
        if self.header.log_end() > file_len {
            warn!(
                id = %self.id,
                log_end = self.header.log_end(),
                file_len,
                "log extends past end of file"
            );
            let limit = file_len.saturating_sub(self.header.log_start);
            self.valid_prefix = self.replay(limit)?;
            return Ok(Some(ErrorKind::FileLength));
        }

        let disk = self
            .region
            .read(self.header.log_start, self.header.actual_size as usize)?;
        let crc = crc32fast::hash(disk);
        let content_ok = crc == self.header.content_crc;

        self.valid_prefix = self.replay(self.header.actual_size)?;
        if !content_ok {
            warn!(
                id = %self.id,
                expected = self.header.content_crc,
                actual = crc,
                valid_prefix = self.valid_prefix,
                "content checksum mismatch"
            );
            return Ok(Some(ErrorKind::CrcMismatch));
        }
        if self.valid_prefix != self.header.actual_size {
            warn!(id = %self.id, valid_prefix = self.valid_prefix, "trailing bytes failed record validation");
            return Ok(Some(ErrorKind::CrcMismatch));
        }
        debug!(id = %self.id, keys = self.index.len(), bytes = self.header.actual_size, "replayed log");
        Ok(None)
    }

    /// Replays up to `limit` log bytes into the index; returns the length
    /// of the cleanly decoded prefix.
    fn replay(&mut self, limit: u64) -> CoreResult<u64> {
        let mut plain = self.region.read(self.header.log_start, limit as usize)?.to_vec();
        if let Some(cipher) = &self.cipher {
            cipher.apply(0, &mut plain);
        }
        let index = &mut self.index;
        let stale = &mut self.stale_bytes;
        Ok(replay_records(&plain, |record, offset, len| {
            apply_to(index, stale, record, offset, len);
        }))
    }

    fn apply(&mut self, record: &Record, offset: u64, len: u64) {
        apply_to(&mut self.index, &mut self.stale_bytes, record, offset, len);
    }
}

impl std::fmt::Debug for AppendLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppendLog")
            .field("id", &self.id)
            .field("header", &self.header)
            .field("keys", &self.index.len())
            .field("stale_bytes", &self.stale_bytes)
            .finish_non_exhaustive()
    }
}

/// Walks `plain` record by record, calling `visit` for each, and returns
/// the length of the prefix that decoded.
pub(crate) fn replay_records(plain: &[u8], mut visit: impl FnMut(&Record, u64, u64)) -> u64 {
    let mut offset = 0usize;
    while offset < plain.len() {
        match Record::decode(&plain[offset..]) {
            Ok((record, len)) => {
                visit(&record, offset as u64, len as u64);
                offset += len;
            }
            Err(e) => {
                debug!(offset, error = %e, "replay stopped");
                break;
            }
        }
    }
    offset as u64
}

fn apply_to(
    index: &mut HashMap<String, IndexEntry>,
    stale: &mut u64,
    record: &Record,
    offset: u64,
    len: u64,
) {
    if record.is_tombstone() {
        if let Some(old) = index.remove(&record.key) {
            *stale += u64::from(old.len);
        }
        *stale += len;
        return;
    }
    let entry = IndexEntry {
        offset,
        len: u32::try_from(len).unwrap_or(u32::MAX),
        expire_at: record.expire_at,
    };
    if let Some(old) = index.insert(record.key.clone(), entry) {
        *stale += u64::from(old.len);
    }
}

const fn align8(n: u64) -> u64 {
    n.saturating_add(7) & !7
}

#[cfg(test)]
mod tests {
    use super::*;
    use mapkv_codec::{encode_value, Value};
    use mapkv_storage::MemoryRegion;

    fn policy() -> CompactionPolicy {
        CompactionPolicy::new(0.5, 4096)
    }

    fn open_log(region: MemoryRegion, key: Option<&str>) -> (AppendLog, Option<ErrorKind>) {
        AppendLog::open(
            "test",
            Box::new(region),
            key.map(|k| CryptKey::new(k).unwrap()),
            true,
            true,
            Arc::new(StoreStats::new()),
        )
        .unwrap()
    }

    fn put(log: &mut AppendLog, key: &str, value: Value) -> u64 {
        log.append(&Record::put(key, encode_value(&value), None), &policy())
            .unwrap()
    }

    fn value_of(log: &AppendLog, key: &str) -> Option<Value> {
        log.live_record(key, 0)
            .unwrap()
            .map(|r| r.decode_value().unwrap())
    }

    fn region_bytes(log: &AppendLog) -> Vec<u8> {
        log.region.as_slice().unwrap().to_vec()
    }

    #[test]
    fn fresh_log_commits_header() {
        let (log, damage) = open_log(MemoryRegion::new(4096), None);
        assert!(damage.is_none());
        assert_eq!(log.header().sequence, 1);
        assert_eq!(log.header().actual_size, 0);
        assert!(!log.is_stale().unwrap());
    }

    #[test]
    fn append_and_replay() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "a", Value::I32(1));
        put(&mut log, "b", Value::Str("two".into()));
        put(&mut log, "a", Value::I32(3));

        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&log)), None);
        assert!(damage.is_none());
        assert_eq!(reopened.index().len(), 2);
        assert_eq!(value_of(&reopened, "a"), Some(Value::I32(3)));
        assert_eq!(value_of(&reopened, "b"), Some(Value::Str("two".into())));
        assert_eq!(reopened.stale_bytes(), log.stale_bytes());
        assert!(reopened.stale_bytes() > 0);
    }

    #[test]
    fn tombstone_survives_reopen() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "gone", Value::Bool(true));
        log.append(&Record::tombstone("gone"), &policy()).unwrap();
        assert!(log.index().is_empty());

        let (reopened, _) = open_log(MemoryRegion::with_data(region_bytes(&log)), None);
        assert!(reopened.index().is_empty());
    }

    #[test]
    fn growth_preserves_content() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        for i in 0..200 {
            put(&mut log, &format!("key-{i}"), Value::Bytes(vec![i as u8; 40]));
        }
        assert!(log.capacity() > 4096);
        assert!(log.stats.growths() > 0);
        for i in 0..200 {
            assert_eq!(
                value_of(&log, &format!("key-{i}")),
                Some(Value::Bytes(vec![i as u8; 40]))
            );
        }
    }

    #[test]
    fn overflow_with_stale_bytes_compacts() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        // Rewrite one key until the page fills; compaction must kick in.
        for i in 0..400u32 {
            put(&mut log, "counter", Value::U32(i));
        }
        assert!(log.stats.compactions() > 0);
        assert_eq!(value_of(&log, "counter"), Some(Value::U32(399)));
        assert_eq!(log.index().len(), 1);
    }

    #[test]
    fn compaction_keeps_live_and_drops_expired() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "keep", Value::I64(-1));
        log.append(
            &Record::put("old", encode_value(&Value::I64(5)), Some(1)),
            &policy(),
        )
        .unwrap();
        put(&mut log, "keep", Value::I64(-2));

        let result = log.compact(0, &policy()).unwrap();
        assert_eq!(result.live_records, 1);
        assert_eq!(result.expired_dropped, 1);
        assert_eq!(log.stale_bytes(), 0);
        assert_eq!(log.header().log_start, HEADER_SIZE);
        assert_eq!(value_of(&log, "keep"), Some(Value::I64(-2)));

        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&log)), None);
        assert!(damage.is_none());
        assert_eq!(reopened.index().len(), 1);
    }

    #[test]
    fn phase_one_state_is_loadable() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "a", Value::I32(1));
        put(&mut log, "a", Value::I32(2));
        log.compact(0, &policy()).unwrap();

        // Roll back to the phase-1 slot: content lives at the scratch offset.
        let mut bytes = region_bytes(&log);
        let phase2 = log.header().clone();
        let mut phase1 = phase2.clone();
        phase1.sequence -= 1;
        let slot = phase1.slot_offset() as usize;
        let other = phase2.slot_offset() as usize;
        let staged = Header::decode(&bytes[slot..slot + SLOT_SIZE]).unwrap();
        let (scratch_start, len) = (staged.log_start, staged.actual_size);
        assert!(scratch_start > HEADER_SIZE);
        assert_eq!(len, phase2.actual_size);
        bytes[other..other + SLOT_SIZE].fill(0);

        let (reopened, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert!(damage.is_none());
        assert_eq!(reopened.header().log_start, scratch_start);
        assert_eq!(value_of(&reopened, "a"), Some(Value::I32(2)));
    }

    #[test]
    fn torn_append_is_invisible() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "a", Value::I32(1));
        let committed = region_bytes(&log);

        // Record bytes written but header never committed.
        let mut bytes = committed;
        let tail = Record::put("b", encode_value(&Value::I32(2)), None).encode().unwrap();
        let at = log.header().log_end() as usize;
        bytes[at..at + tail.len()].copy_from_slice(&tail);

        let (reopened, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert!(damage.is_none());
        assert_eq!(reopened.index().len(), 1);
        assert!(value_of(&reopened, "b").is_none());
    }

    #[test]
    fn content_damage_is_reported_then_recovered() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "first", Value::I32(1));
        let first_end = log.header().log_end() as usize;
        put(&mut log, "second", Value::I32(2));

        let mut bytes = region_bytes(&log);
        bytes[first_end + 6] ^= 0xFF;

        let (mut damaged, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert_eq!(damage, Some(ErrorKind::CrcMismatch));
        damaged.recover().unwrap();
        assert_eq!(damaged.index().len(), 1);
        assert_eq!(value_of(&damaged, "first"), Some(Value::I32(1)));

        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&damaged)), None);
        assert!(damage.is_none());
        assert_eq!(reopened.index().len(), 1);
    }

    #[test]
    fn encrypted_recovery_rekeys_before_new_appends() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), Some("secret"));
        put(&mut log, "first", Value::I32(1));
        let first_end = log.header().log_end() as usize;
        put(&mut log, "second", Value::Str("tail".into()));
        let nonce = log.header().nonce;

        let mut bytes = region_bytes(&log);
        bytes[first_end + 6] ^= 0xFF;

        let (mut damaged, damage) = open_log(MemoryRegion::with_data(bytes), Some("secret"));
        assert_eq!(damage, Some(ErrorKind::CrcMismatch));
        damaged.recover().unwrap();
        assert_ne!(damaged.header().nonce, nonce);
        assert_eq!(value_of(&damaged, "first"), Some(Value::I32(1)));

        put(&mut damaged, "third", Value::I32(3));
        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&damaged)), Some("secret"));
        assert!(damage.is_none());
        assert_eq!(value_of(&reopened, "first"), Some(Value::I32(1)));
        assert_eq!(value_of(&reopened, "third"), Some(Value::I32(3)));
        assert!(value_of(&reopened, "second").is_none());
    }

    #[test]
    fn reset_discards_everything() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "a", Value::I32(1));
        let mut bytes = region_bytes(&log);
        let at = HEADER_SIZE as usize + 3;
        bytes[at] ^= 0xFF;

        let (mut damaged, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert!(damage.is_some());
        damaged.reset().unwrap();
        assert!(damaged.index().is_empty());
        assert_eq!(damaged.header().actual_size, 0);

        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&damaged)), None);
        assert!(damage.is_none());
        assert!(reopened.index().is_empty());
    }

    #[test]
    fn header_loss_recovers_plain_records() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "a", Value::I32(1));
        put(&mut log, "b", Value::I32(2));
        let mut bytes = region_bytes(&log);
        bytes[..HEADER_SIZE as usize].fill(0xEE);

        let (mut damaged, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert_eq!(damage, Some(ErrorKind::CrcMismatch));
        assert!(damaged.index().is_empty());
        damaged.recover().unwrap();
        assert_eq!(value_of(&damaged, "b"), Some(Value::I32(2)));
        assert_eq!(damaged.index().len(), 2);
    }

    #[test]
    fn length_damage_detected() {
        let (mut log, _) = open_log(MemoryRegion::new(8192), None);
        put(&mut log, "a", Value::Bytes(vec![1; 5000]));
        let mut bytes = region_bytes(&log);
        bytes.truncate(4096);

        let (_damaged, damage) = open_log(MemoryRegion::with_data(bytes), None);
        assert_eq!(damage, Some(ErrorKind::FileLength));
    }

    #[test]
    fn encrypted_log_roundtrip() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), Some("secret"));
        assert!(log.header().encrypted);
        put(&mut log, "token", Value::Str("abc123".into()));

        let bytes = region_bytes(&log);
        let needle = b"abc123";
        assert!(!bytes.windows(needle.len()).any(|w| w == needle));

        let (reopened, damage) = open_log(MemoryRegion::with_data(bytes.clone()), Some("secret"));
        assert!(damage.is_none());
        assert_eq!(value_of(&reopened, "token"), Some(Value::Str("abc123".into())));

        let wrong = AppendLog::open(
            "test",
            Box::new(MemoryRegion::with_data(bytes.clone())),
            Some(CryptKey::new("guess").unwrap()),
            true,
            true,
            Arc::new(StoreStats::new()),
        );
        assert!(matches!(wrong, Err(CoreError::InvalidCryptKey { .. })));

        let missing = AppendLog::open(
            "test",
            Box::new(MemoryRegion::with_data(bytes)),
            None,
            true,
            true,
            Arc::new(StoreStats::new()),
        );
        assert!(matches!(
            missing,
            Err(CoreError::CryptStateMismatch { encrypted: true, .. })
        ));
    }

    #[test]
    fn encrypted_compaction_uses_fresh_nonce() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), Some("secret"));
        put(&mut log, "a", Value::I32(1));
        put(&mut log, "a", Value::I32(2));
        let nonce = log.header().nonce;
        log.compact(0, &policy()).unwrap();
        assert_ne!(log.header().nonce, nonce);
        assert_eq!(value_of(&log, "a"), Some(Value::I32(2)));

        let (reopened, damage) = open_log(MemoryRegion::with_data(region_bytes(&log)), Some("secret"));
        assert!(damage.is_none());
        assert_eq!(value_of(&reopened, "a"), Some(Value::I32(2)));
    }

    #[test]
    fn trim_and_clear_shrink() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        for i in 0..300 {
            put(&mut log, &format!("k{i}"), Value::Bytes(vec![0; 64]));
        }
        for i in 1..300 {
            log.append(&Record::tombstone(format!("k{i}")), &policy()).unwrap();
        }
        let grown = log.capacity();
        log.trim(&policy()).unwrap();
        assert!(log.capacity() < grown);
        assert_eq!(log.index().len(), 1);

        log.clear(4096).unwrap();
        assert_eq!(log.capacity(), 4096);
        assert!(log.index().is_empty());
        assert_eq!(log.header().actual_size, 0);
    }

    #[test]
    fn replace_plain_bumps_sequence() {
        let (mut log, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut log, "live", Value::I32(1));

        let mut content = Record::put("restored", encode_value(&Value::I32(9)), None)
            .encode()
            .unwrap();
        content.extend(Record::put("other", encode_value(&Value::Bool(false)), None).encode().unwrap());

        log.replace_plain(content, 100).unwrap();
        assert!(log.header().sequence > 100);
        assert!(value_of(&log, "live").is_none());
        assert_eq!(value_of(&log, "restored"), Some(Value::I32(9)));

        let bad = vec![0xAB; 12];
        assert!(log.replace_plain(bad, 0).is_err());
        assert_eq!(value_of(&log, "restored"), Some(Value::I32(9)));
    }

    #[test]
    fn raw_replace_adopts_encryption() {
        let (mut source, _) = open_log(MemoryRegion::new(4096), Some("secret"));
        put(&mut source, "token", Value::Str("abc".into()));
        let source_header = source.header().clone();
        let start = source_header.log_start as usize;
        let disk = region_bytes(&source)[start..start + source_header.actual_size as usize].to_vec();

        let (mut plain, _) = open_log(MemoryRegion::new(4096), None);
        put(&mut plain, "old", Value::I32(1));
        let bytes = region_bytes(&plain);

        let mut raw = AppendLog::open_raw(
            "test",
            Box::new(MemoryRegion::with_data(bytes)),
            true,
            Arc::new(StoreStats::new()),
        )
        .unwrap();
        raw.replace_raw(&source_header, &disk).unwrap();
        assert!(raw.header().sequence > source_header.sequence);

        let (restored, damage) = open_log(MemoryRegion::with_data(region_bytes(&raw)), Some("secret"));
        assert!(damage.is_none());
        assert_eq!(value_of(&restored, "token"), Some(Value::Str("abc".into())));
        assert!(value_of(&restored, "old").is_none());
    }

    #[test]
    fn align8_rounds_up() {
        assert_eq!(align8(0), 0);
        assert_eq!(align8(1), 8);
        assert_eq!(align8(256), 256);
        assert_eq!(align8(257), 264);
    }
}
