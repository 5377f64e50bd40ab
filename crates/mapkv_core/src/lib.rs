//! # MapKV Core
//!
//! Memory-mapped key-value store engine.
//!
//! This crate provides:
//! - An append log with an in-memory index over a mapped file
//! - Crash-consistent commits through a double-slot header
//! - Compaction and incremental file growth
//! - Cross-process coordination through file locks and a version counter
//! - Optional AES-256-CTR encryption
//! - Per-key expiration
//! - Backup, restore and storage removal
//! - A registry that shares one instance per store identity
//!
//! ## Example
//!
//! ```rust,no_run
//! use mapkv_core::{Config, Mode, OpenOptions, Registry};
//!
//! let registry = Registry::new("/tmp/mapkv", Config::default());
//! let store = registry
//!     .open("settings", OpenOptions::new().mode(Mode::MultiProcess))
//!     .unwrap();
//!
//! store.set("volume", 0.8f64);
//! store.set_with_ttl("session", "abc", 3600);
//! assert!(store.contains("session"));
//! assert_eq!(store.get_f64("volume", 1.0), 0.8);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backup;
mod change_feed;
mod compaction;
mod config;
mod crypto;
mod error;
mod expiry;
mod handlers;
mod header;
mod layout;
mod lock;
mod log;
mod logging;
mod record;
mod registry;
mod stats;
mod store;

pub use backup::{verify_file, VerifyReport};
pub use change_feed::{ChangeOrigin, ContentChange};
pub use compaction::{CompactionPolicy, CompactionResult};
pub use config::{Config, InitOptions, Mode, OpenOptions};
pub use crypto::{CryptKey, MAX_CRYPT_KEY_LEN};
pub use error::{CoreError, CoreResult};
pub use expiry::{is_expired, now_secs, Ttl};
pub use handlers::{ContentChangeHandler, ErrorHandler, ErrorKind, ErrorPolicy};
pub use header::{read_header, Header, HeaderState, HEADER_SIZE};
pub use layout::{list_stems, store_stem, StorePaths, DATA_EXT, LOCK_EXT};
pub use lock::{LockKind, ProcessLock};
pub use log::IndexEntry;
pub use logging::{register_log_handler, set_log_level, LogHandler, LogLevel, LogRecord};
pub use record::{Record, RecordFlags};
pub use registry::{initialize, on_exit, registry, Registry};
pub use stats::{StatsSnapshot, StoreStats};
pub use store::Store;

pub use mapkv_codec::{FromValue, Value, ValueType};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
