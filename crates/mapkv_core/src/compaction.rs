//! Log compaction.
//!
//! Compaction rewrites the log so it holds exactly one record per live key
//! and no tombstones, dropping every record whose expiry has passed.
//!
//! ## Invariants
//!
//! - Compaction **MUST NOT** change the visible key/value state
//! - Surviving records keep their relative write order
//! - The rewritten bytes are staged and committed before the old log is
//!   overwritten (see the two-phase publish in the log module)

use crate::error::CoreResult;
use crate::expiry::is_expired;
use crate::log::IndexEntry;
use std::collections::HashMap;

/// When a mutation should trigger compaction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompactionPolicy {
    /// Minimum stale/actual ratio.
    pub ratio: f64,
    /// Minimum stale bytes.
    pub min_stale_bytes: u64,
}

impl Default for CompactionPolicy {
    fn default() -> Self {
        Self::new(0.5, 4096)
    }
}

impl CompactionPolicy {
    /// Creates a policy.
    #[must_use]
    pub const fn new(ratio: f64, min_stale_bytes: u64) -> Self {
        Self {
            ratio,
            min_stale_bytes,
        }
    }

    /// Returns `true` if `stale` of `actual` log bytes warrant a rewrite.
    #[must_use]
    pub fn should_compact(&self, stale: u64, actual: u64) -> bool {
        if stale == 0 || actual == 0 || stale < self.min_stale_bytes {
            return false;
        }
        stale as f64 / actual as f64 >= self.ratio
    }

    /// Live bytes above which a freshly compacted log gets more room.
    #[must_use]
    pub const fn free_target(&self, usable: u64) -> u64 {
        usable / 2
    }
}

/// Outcome of one compaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionResult {
    /// Records in the rewritten log.
    pub live_records: usize,
    /// Expired records dropped.
    pub expired_dropped: usize,
    /// Log bytes before the rewrite that were indexed.
    pub input_bytes: u64,
    /// Log bytes after the rewrite.
    pub output_bytes: u64,
}

/// A rewritten log, not yet published.
#[derive(Debug)]
pub(crate) struct Compacted {
    /// Plaintext records, back to back.
    pub content: Vec<u8>,
    /// Index over `content`.
    pub index: HashMap<String, IndexEntry>,
    pub result: CompactionResult,
}

/// Builds the compacted log from `index`, reading each live record's
/// plaintext through `read`.
pub(crate) fn compact(
    index: &HashMap<String, IndexEntry>,
    now: u64,
    mut read: impl FnMut(&IndexEntry) -> CoreResult<Vec<u8>>,
) -> CoreResult<Compacted> {
    let mut entries: Vec<(&String, &IndexEntry)> = index.iter().collect();
    entries.sort_by_key(|(_, entry)| entry.offset);

    let input_bytes = entries.iter().map(|(_, e)| u64::from(e.len)).sum();
    let mut content = Vec::with_capacity(input_bytes as usize);
    let mut rebuilt = HashMap::with_capacity(entries.len());
    let mut expired_dropped = 0;

    for (key, entry) in entries {
        if is_expired(entry.expire_at, now) {
            expired_dropped += 1;
            continue;
        }
        let bytes = read(entry)?;
        rebuilt.insert(
            key.clone(),
            IndexEntry {
                offset: content.len() as u64,
                ..*entry
            },
        );
        content.extend_from_slice(&bytes);
    }

    let result = CompactionResult {
        live_records: rebuilt.len(),
        expired_dropped,
        input_bytes,
        output_bytes: content.len() as u64,
    };
    Ok(Compacted {
        content,
        index: rebuilt,
        result,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreError;

    fn entry(offset: u64, len: u32, expire_at: Option<u64>) -> IndexEntry {
        IndexEntry {
            offset,
            len,
            expire_at,
        }
    }

    #[test]
    fn policy_thresholds() {
        let policy = CompactionPolicy::new(0.5, 100);
        assert!(!policy.should_compact(0, 1000));
        assert!(!policy.should_compact(99, 100));
        assert!(!policy.should_compact(100, 300));
        assert!(policy.should_compact(150, 300));
        assert!(policy.should_compact(300, 300));
        assert_eq!(policy.free_target(8192), 4096);
    }

    #[test]
    fn compaction_preserves_order_and_drops_expired() {
        let mut index = HashMap::new();
        index.insert("late".to_string(), entry(20, 4, None));
        index.insert("early".to_string(), entry(0, 3, None));
        index.insert("expired".to_string(), entry(10, 5, Some(50)));

        let log = b"AAA.......EEEEE.....LLLL".to_vec();
        let compacted = compact(&index, 100, |e| {
            Ok(log[e.offset as usize..e.offset as usize + e.len as usize].to_vec())
        })
        .unwrap();

        assert_eq!(compacted.content, b"AAALLLL");
        assert_eq!(compacted.index["early"].offset, 0);
        assert_eq!(compacted.index["late"].offset, 3);
        assert!(!compacted.index.contains_key("expired"));
        assert_eq!(compacted.result.live_records, 2);
        assert_eq!(compacted.result.expired_dropped, 1);
        assert_eq!(compacted.result.input_bytes, 12);
        assert_eq!(compacted.result.output_bytes, 7);
    }

    #[test]
    fn read_failure_propagates() {
        let mut index = HashMap::new();
        index.insert("k".to_string(), entry(0, 1, None));
        let result = compact(&index, 0, |_| Err(CoreError::corrupt_data("bad")));
        assert!(result.is_err());
    }
}
