//! Store configuration.

use crate::crypto::CryptKey;
use crate::logging::{LogHandler, LogLevel};
use std::path::PathBuf;
use std::time::Duration;

/// How a store coordinates with other users of its file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Mode {
    /// Only this process touches the file; no file locks are taken.
    #[default]
    SingleProcess,
    /// Other processes may map the same file; every operation takes the
    /// file lock and reloads when another process changed the content.
    MultiProcess,
    /// Reads only, coordinated like [`Mode::MultiProcess`]. The file must
    /// already exist.
    ReadOnly,
}

impl Mode {
    /// Returns `true` if operations take the cross-process file lock.
    #[must_use]
    pub const fn uses_file_lock(self) -> bool {
        !matches!(self, Self::SingleProcess)
    }

    /// Returns `true` if mutations are allowed.
    #[must_use]
    pub const fn is_writable(self) -> bool {
        !matches!(self, Self::ReadOnly)
    }
}

/// Registry-wide tuning shared by every store it opens.
#[derive(Debug, Clone)]
pub struct Config {
    /// Mode used when [`OpenOptions::mode`] is not set.
    pub default_mode: Mode,

    /// Longest wait for a file lock (`None` = wait forever).
    pub lock_timeout: Option<Duration>,

    /// Minimum stale/actual ratio before a mutation triggers compaction.
    pub compaction_ratio: f64,

    /// Minimum stale bytes before a mutation triggers compaction.
    pub compaction_min_stale_bytes: u64,

    /// Whether to msync the record and header on every commit.
    pub sync_on_write: bool,

    /// Whether new stores start with compare-before-set enabled.
    pub compare_before_set: bool,

    /// Expected payload size used when [`OpenOptions::expected_capacity`]
    /// is zero.
    pub default_expected_capacity: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            default_mode: Mode::SingleProcess,
            lock_timeout: None,
            compaction_ratio: 0.5,
            compaction_min_stale_bytes: 4096,
            sync_on_write: true,
            compare_before_set: false,
            default_expected_capacity: 0,
        }
    }
}

impl Config {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default mode.
    #[must_use]
    pub const fn default_mode(mut self, mode: Mode) -> Self {
        self.default_mode = mode;
        self
    }

    /// Sets the file lock timeout.
    #[must_use]
    pub const fn lock_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.lock_timeout = timeout;
        self
    }

    /// Sets the compaction ratio.
    #[must_use]
    pub const fn compaction_ratio(mut self, ratio: f64) -> Self {
        self.compaction_ratio = ratio;
        self
    }

    /// Sets the minimum stale bytes for compaction.
    #[must_use]
    pub const fn compaction_min_stale_bytes(mut self, bytes: u64) -> Self {
        self.compaction_min_stale_bytes = bytes;
        self
    }

    /// Sets whether to msync on every commit.
    #[must_use]
    pub const fn sync_on_write(mut self, value: bool) -> Self {
        self.sync_on_write = value;
        self
    }

    /// Sets whether compare-before-set starts enabled.
    #[must_use]
    pub const fn compare_before_set(mut self, value: bool) -> Self {
        self.compare_before_set = value;
        self
    }

    /// Sets the default expected capacity.
    #[must_use]
    pub const fn default_expected_capacity(mut self, bytes: u64) -> Self {
        self.default_expected_capacity = bytes;
        self
    }
}

/// Per-open settings.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    /// Coordination mode; falls back to [`Config::default_mode`].
    pub mode: Option<Mode>,
    /// Secret for an encrypted store.
    pub crypt_key: Option<CryptKey>,
    /// Directory holding the store; falls back to the registry root.
    pub root_dir: Option<PathBuf>,
    /// Payload bytes the store should hold without growing.
    pub expected_capacity: u64,
}

impl OpenOptions {
    /// Creates options with every field defaulted.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the mode.
    #[must_use]
    pub fn mode(mut self, mode: Mode) -> Self {
        self.mode = Some(mode);
        self
    }

    /// Sets the crypt key.
    #[must_use]
    pub fn crypt_key(mut self, key: CryptKey) -> Self {
        self.crypt_key = Some(key);
        self
    }

    /// Sets the root directory.
    #[must_use]
    pub fn root_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.root_dir = Some(dir.into());
        self
    }

    /// Sets the expected capacity.
    #[must_use]
    pub fn expected_capacity(mut self, bytes: u64) -> Self {
        self.expected_capacity = bytes;
        self
    }
}

/// Process-wide settings for [`crate::initialize`].
#[derive(Clone)]
pub struct InitOptions {
    /// Default root directory for stores.
    pub root_dir: PathBuf,
    /// Minimum level of log events.
    pub log_level: LogLevel,
    /// Receiver for log events; `None` prints them to stderr.
    pub log_handler: Option<LogHandler>,
    /// Registry tuning.
    pub config: Config,
}

impl InitOptions {
    /// Creates options for `root_dir` with info-level logging to stderr.
    #[must_use]
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
            log_level: LogLevel::Info,
            log_handler: None,
            config: Config::default(),
        }
    }

    /// Sets the log level.
    #[must_use]
    pub fn log_level(mut self, level: LogLevel) -> Self {
        self.log_level = level;
        self
    }

    /// Sets the log handler.
    #[must_use]
    pub fn log_handler(mut self, handler: LogHandler) -> Self {
        self.log_handler = Some(handler);
        self
    }

    /// Sets the registry configuration.
    #[must_use]
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }
}

impl std::fmt::Debug for InitOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitOptions")
            .field("root_dir", &self.root_dir)
            .field("log_level", &self.log_level)
            .field("log_handler", &self.log_handler.is_some())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = Config::new()
            .default_mode(Mode::MultiProcess)
            .lock_timeout(Some(Duration::from_millis(250)))
            .compaction_ratio(0.25)
            .compaction_min_stale_bytes(1024)
            .sync_on_write(false)
            .compare_before_set(true)
            .default_expected_capacity(1 << 20);

        assert_eq!(config.default_mode, Mode::MultiProcess);
        assert_eq!(config.lock_timeout, Some(Duration::from_millis(250)));
        assert!((config.compaction_ratio - 0.25).abs() < f64::EPSILON);
        assert_eq!(config.compaction_min_stale_bytes, 1024);
        assert!(!config.sync_on_write);
        assert!(config.compare_before_set);
        assert_eq!(config.default_expected_capacity, 1 << 20);
    }

    #[test]
    fn mode_capabilities() {
        assert!(!Mode::SingleProcess.uses_file_lock());
        assert!(Mode::MultiProcess.uses_file_lock());
        assert!(Mode::ReadOnly.uses_file_lock());
        assert!(!Mode::ReadOnly.is_writable());
        assert!(Mode::MultiProcess.is_writable());
    }

    #[test]
    fn open_options_builder() {
        let opts = OpenOptions::new()
            .mode(Mode::ReadOnly)
            .root_dir("/tmp/kv")
            .expected_capacity(4096);
        assert_eq!(opts.mode, Some(Mode::ReadOnly));
        assert_eq!(opts.root_dir, Some(PathBuf::from("/tmp/kv")));
        assert_eq!(opts.expected_capacity, 4096);
        assert!(opts.crypt_key.is_none());
    }
}
