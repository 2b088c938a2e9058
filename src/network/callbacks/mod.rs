//! PGN callback registries. Callbacks are shared closures; a registration
//! is identified by the closure allocation itself, so the same `Arc` must
//! be used to remove what was added. Registries reject duplicates and are
//! never locked while a callback runs.
use std::sync::{Arc, Mutex};

use crate::network::message::CanMessage;

/// Callback invoked with a received message.
pub type MessageCallback = Arc<dyn Fn(&CanMessage) + Send + Sync>;

struct Entry {
    pgn: u32,
    callback: MessageCallback,
}

pub(crate) struct PgnCallbackRegistry {
    entries: Mutex<Vec<Entry>>,
}

impl PgnCallbackRegistry {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Register `callback` for `pgn`. Returns `false` when the same closure
    /// is already registered for that PGN.
    pub(crate) fn add(&self, pgn: u32, callback: MessageCallback) -> bool {
        let mut entries = self.entries.lock().unwrap();
        if entries
            .iter()
            .any(|entry| entry.pgn == pgn && Arc::ptr_eq(&entry.callback, &callback))
        {
            return false;
        }
        entries.push(Entry { pgn, callback });
        true
    }

    /// Remove a previous registration. Returns `false` when it was absent.
    pub(crate) fn remove(&self, pgn: u32, callback: &MessageCallback) -> bool {
        let mut entries = self.entries.lock().unwrap();
        let before = entries.len();
        entries.retain(|entry| !(entry.pgn == pgn && Arc::ptr_eq(&entry.callback, callback)));
        entries.len() != before
    }

    /// Snapshot the callbacks registered for `pgn`. Taken under the lock so
    /// the invocations themselves happen without it.
    pub(crate) fn matching(&self, pgn: u32) -> Vec<MessageCallback> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.pgn == pgn)
            .map(|entry| Arc::clone(&entry.callback))
            .collect()
    }
}
