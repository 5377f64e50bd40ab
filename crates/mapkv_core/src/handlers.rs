//! Callbacks a host registers with the registry.
//!
//! - the error handler decides what happens to a store whose file fails
//!   validation on load
//! - the content-change handler hears about every reload caused by another
//!   process (per-store subscribers use [`crate::Store::subscribe`] instead)

use parking_lot::RwLock;
use std::sync::Arc;
use tracing::debug;

/// Kind of damage found when loading a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A header slot, the content checksum or a record checksum failed.
    CrcMismatch,
    /// The header claims more log bytes than the file holds.
    FileLength,
}

/// What to do with a damaged store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorPolicy {
    /// Reinitialize the store empty.
    #[default]
    Discard,
    /// Keep the longest prefix of records that still validate.
    Recover,
    /// Show the store as empty but leave the file untouched until the
    /// first write, which then discards it.
    Keep,
}

/// Callback deciding the [`ErrorPolicy`] for a damaged store id.
pub type ErrorHandler = Arc<dyn Fn(&str, ErrorKind) -> ErrorPolicy + Send + Sync>;

/// Callback told the id of a store another process changed.
pub type ContentChangeHandler = Arc<dyn Fn(&str) + Send + Sync>;

/// Registered callbacks, shared by a registry and its stores.
#[derive(Default)]
pub struct Handlers {
    error: RwLock<Option<ErrorHandler>>,
    content_change: RwLock<Option<ContentChangeHandler>>,
}

impl Handlers {
    /// Creates an empty set of handlers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the error handler, replacing any previous one.
    pub fn set_error_handler(&self, handler: Option<ErrorHandler>) {
        *self.error.write() = handler;
    }

    /// Installs the content-change handler, replacing any previous one.
    pub fn set_content_change_handler(&self, handler: Option<ContentChangeHandler>) {
        *self.content_change.write() = handler;
    }

    /// Asks the error handler for a policy; [`ErrorPolicy::Discard`] when
    /// none is registered.
    pub fn on_error(&self, id: &str, kind: ErrorKind) -> ErrorPolicy {
        let handler = self.error.read().clone();
        let policy = handler.map_or(ErrorPolicy::default(), |h| h(id, kind));
        debug!(id, ?kind, ?policy, "error policy chosen");
        policy
    }

    /// Notifies the content-change handler, if any.
    pub fn on_content_changed(&self, id: &str) {
        let handler = self.content_change.read().clone();
        if let Some(handler) = handler {
            handler(id);
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers")
            .field("error", &self.error.read().is_some())
            .field("content_change", &self.content_change.read().is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[test]
    fn default_policy_is_discard() {
        let handlers = Handlers::new();
        assert_eq!(handlers.on_error("s", ErrorKind::CrcMismatch), ErrorPolicy::Discard);
    }

    #[test]
    fn registered_error_handler_decides() {
        let handlers = Handlers::new();
        handlers.set_error_handler(Some(Arc::new(|_, kind| match kind {
            ErrorKind::CrcMismatch => ErrorPolicy::Recover,
            ErrorKind::FileLength => ErrorPolicy::Keep,
        })));
        assert_eq!(handlers.on_error("s", ErrorKind::CrcMismatch), ErrorPolicy::Recover);
        assert_eq!(handlers.on_error("s", ErrorKind::FileLength), ErrorPolicy::Keep);

        handlers.set_error_handler(None);
        assert_eq!(handlers.on_error("s", ErrorKind::FileLength), ErrorPolicy::Discard);
    }

    #[test]
    fn content_change_handler_receives_id() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let handlers = Handlers::new();
        handlers.on_content_changed("ignored");

        let sink = Arc::clone(&seen);
        handlers.set_content_change_handler(Some(Arc::new(move |id| sink.lock().push(id.to_string()))));
        handlers.on_content_changed("prefs");
        assert_eq!(*seen.lock(), vec!["prefs".to_string()]);
    }
}
