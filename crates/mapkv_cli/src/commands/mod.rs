//! CLI command implementations.

pub mod backup;
pub mod compact;
pub mod inspect;
pub mod kv;
pub mod verify;

use mapkv_core::{Config, CryptKey, Mode, OpenOptions, Registry, Store};
use std::path::Path;
use std::sync::Arc;

/// Error type shared by every command.
pub type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

/// Where the command operates and with which secret.
#[derive(Debug, Clone)]
pub struct Target<'a> {
    /// Store directory.
    pub root: &'a Path,
    /// Crypt key for encrypted stores.
    pub crypt_key: Option<&'a str>,
}

impl Target<'_> {
    /// Builds a registry that coordinates with other processes using the
    /// same directory.
    pub fn registry(&self) -> Registry {
        Registry::new(self.root, Config::default().default_mode(Mode::MultiProcess))
    }

    /// Opens `id` in `mode`.
    pub fn open(&self, registry: &Registry, id: &str, mode: Mode) -> CliResult<Arc<Store>> {
        let mut options = OpenOptions::new().mode(mode);
        if let Some(key) = self.crypt_key {
            options = options.crypt_key(CryptKey::new(key)?);
        }
        Ok(registry.open(id, options)?)
    }

    /// Parses the crypt key, if any.
    pub fn key(&self) -> CliResult<Option<CryptKey>> {
        Ok(self.crypt_key.map(CryptKey::new).transpose()?)
    }
}

/// Formats a byte count for humans.
pub fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.1} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}
