//! Content-change notifications.
//!
//! A store emits an event whenever its in-memory view is replaced by
//! content it did not write itself: another process committed, a backup
//! was restored, or damaged content was reset. Subscribers receive events
//! through `std::sync::mpsc` channels.
//!
//! ```rust,ignore
//! let changes = store.subscribe();
//! std::thread::spawn(move || {
//!     while let Ok(event) = changes.recv() {
//!         println!("{} changed at sequence {}", event.store_id, event.sequence);
//!     }
//! });
//! ```

use parking_lot::RwLock;
use std::sync::mpsc::{self, Receiver, Sender};

/// What replaced the store's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Another process committed new content.
    External,
    /// A backup was restored into the store.
    Restore,
    /// Damaged content was discarded or truncated.
    Recovery,
}

/// A single content-change event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentChange {
    /// Id of the store that changed.
    pub store_id: String,
    /// Header sequence after the change.
    pub sequence: u64,
    /// Cause of the change.
    pub origin: ChangeOrigin,
}

/// Fan-out of [`ContentChange`] events to subscribers.
pub(crate) struct ChangeFeed {
    subscribers: RwLock<Vec<Sender<ContentChange>>>,
}

impl ChangeFeed {
    pub(crate) fn new() -> Self {
        Self {
            subscribers: RwLock::new(Vec::new()),
        }
    }

    /// Returns a receiver for all future events.
    pub(crate) fn subscribe(&self) -> Receiver<ContentChange> {
        let (tx, rx) = mpsc::channel();
        self.subscribers.write().push(tx);
        rx
    }

    /// Sends `event` to every live subscriber, dropping disconnected ones.
    pub(crate) fn emit(&self, event: ContentChange) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Returns the number of active subscribers.
    pub(crate) fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for ChangeFeed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeFeed")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
