//! Key expiration.
//!
//! Expiry is an absolute Unix time in seconds stored in the record. It is
//! checked lazily on every read; expired records are physically dropped by
//! the next compaction.

use std::time::{SystemTime, UNIX_EPOCH};

/// How a write chooses its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ttl {
    /// Use the store's auto-expire default, if enabled.
    Default,
    /// Never expire, even when auto-expire is enabled.
    Never,
    /// Expire after this many seconds.
    Seconds(u32),
}

impl Ttl {
    /// Maps a binding-style TTL where `0` means "never".
    #[must_use]
    pub const fn from_secs(secs: u32) -> Self {
        if secs == 0 {
            Self::Never
        } else {
            Self::Seconds(secs)
        }
    }

    /// Resolves the absolute expiry for a write at `now`.
    #[must_use]
    pub fn resolve(self, auto_expire: Option<u32>, now: u64) -> Option<u64> {
        let secs = match self {
            Self::Default => auto_expire.filter(|s| *s > 0)?,
            Self::Never => return None,
            Self::Seconds(secs) => secs,
        };
        Some(now.saturating_add(u64::from(secs)))
    }
}

/// Seconds since the Unix epoch.
#[must_use]
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Returns `true` if a record with `expire_at` is expired at `now`.
#[must_use]
pub fn is_expired(expire_at: Option<u64>, now: u64) -> bool {
    expire_at.is_some_and(|at| at <= now)
}
