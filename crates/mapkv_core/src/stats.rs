//! Store statistics.
//!
//! Counters are atomic and can be read while operations are in progress.
//!
//! ```rust,ignore
//! let store = registry.open_default("prefs")?;
//! store.set("theme", "dark");
//!
//! let stats = store.stats();
//! println!("writes: {}, growths: {}", stats.writes, stats.growths);
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

/// Per-store operation counters.
#[derive(Debug, Default)]
pub struct StoreStats {
    reads: AtomicU64,
    writes: AtomicU64,
    removes: AtomicU64,
    bytes_written: AtomicU64,
    growths: AtomicU64,
    compactions: AtomicU64,
    reloads: AtomicU64,
    errors: AtomicU64,
}

impl StoreStats {
    /// Creates a new stats instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_read(&self) {
        self.reads.fetch_add(1, Ordering::Relaxed);
    }

    /// Records an appended put record of `bytes` bytes.
    pub(crate) fn record_write(&self, bytes: u64) {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Records an appended tombstone of `bytes` bytes.
    pub(crate) fn record_remove(&self, bytes: u64) {
        self.removes.fetch_add(1, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn record_growth(&self) {
        self.growths.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_compaction(&self) {
        self.compactions.fetch_add(1, Ordering::Relaxed);
    }

    /// Records a reload caused by another process.
    pub(crate) fn record_reload(&self) {
        self.reloads.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the number of reads.
    pub fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    /// Returns the number of appended put records.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    /// Returns the number of appended tombstones.
    pub fn removes(&self) -> u64 {
        self.removes.load(Ordering::Relaxed)
    }

    /// Returns the total bytes appended to the log.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    /// Returns how often the file grew.
    pub fn growths(&self) -> u64 {
        self.growths.load(Ordering::Relaxed)
    }

    /// Returns how often the log was compacted.
    pub fn compactions(&self) -> u64 {
        self.compactions.load(Ordering::Relaxed)
    }

    /// Returns how often another process's change forced a reload.
    pub fn reloads(&self) -> u64 {
        self.reloads.load(Ordering::Relaxed)
    }

    /// Returns the number of failed operations.
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }

    /// Returns a snapshot of all counters.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            reads: self.reads(),
            writes: self.writes(),
            removes: self.removes(),
            bytes_written: self.bytes_written(),
            growths: self.growths(),
            compactions: self.compactions(),
            reloads: self.reloads(),
            errors: self.errors(),
        }
    }
}

/// A point-in-time copy of [`StoreStats`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    /// Number of reads.
    pub reads: u64,
    /// Number of appended put records.
    pub writes: u64,
    /// Number of appended tombstones.
    pub removes: u64,
    /// Total bytes appended to the log.
    pub bytes_written: u64,
    /// Number of file growths.
    pub growths: u64,
    /// Number of compactions.
    pub compactions: u64,
    /// Number of reloads caused by other processes.
    pub reloads: u64,
    /// Number of failed operations.
    pub errors: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_stats_are_zero() {
        assert_eq!(StoreStats::new().snapshot(), StatsSnapshot::default());
    }

    #[test]
    fn record_operations() {
        let stats = StoreStats::new();
        stats.record_read();
        stats.record_write(40);
        stats.record_write(10);
        stats.record_remove(8);
        stats.record_growth();
        stats.record_compaction();
        stats.record_reload();
        stats.record_error();

        let snap = stats.snapshot();
        assert_eq!(snap.reads, 1);
        assert_eq!(snap.writes, 2);
        assert_eq!(snap.removes, 1);
        assert_eq!(snap.bytes_written, 58);
        assert_eq!(snap.growths, 1);
        assert_eq!(snap.compactions, 1);
        assert_eq!(snap.reloads, 1);
        assert_eq!(snap.errors, 1);
    }

    #[test]
    fn concurrent_updates() {
        use std::sync::Arc;
        use std::thread;

        let stats = Arc::new(StoreStats::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let s = Arc::clone(&stats);
                thread::spawn(move || {
                    for _ in 0..100 {
                        s.record_read();
                        s.record_write(1);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(stats.reads(), 800);
        assert_eq!(stats.writes(), 800);
    }
}
