//! Local event registry owned by each channel.
//!
//! Name-keyed multi-listener dispatch with `on`/`once`/`off`. Each channel
//! owns its registry outright; there is no process-wide emitter.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// Callback for a local event.
pub type EventListener = Arc<dyn Fn(&Value) + Send + Sync>;

/// Handle returned by `on`/`once`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registered {
    id: ListenerId,
    once: bool,
    listener: EventListener,
}

#[derive(Default)]
pub(crate) struct EventRegistry {
    next_id: AtomicU64,
    listeners: RwLock<HashMap<String, Vec<Registered>>>,
}

impl EventRegistry {
    pub(crate) fn on(&self, name: &str, listener: EventListener) -> ListenerId {
        self.insert(name, listener, false)
    }

    pub(crate) fn once(&self, name: &str, listener: EventListener) -> ListenerId {
        self.insert(name, listener, true)
    }

    fn insert(&self, name: &str, listener: EventListener, once: bool) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(name.to_string()).or_default().push(Registered {
            id,
            once,
            listener,
        });
        id
    }

    /// Remove one listener. Returns false if it was not registered under `name`.
    pub(crate) fn off(&self, name: &str, id: ListenerId) -> bool {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        let Some(entries) = listeners.get_mut(name) else {
            return false;
        };
        let before = entries.len();
        entries.retain(|entry| entry.id != id);
        let removed = entries.len() != before;
        if entries.is_empty() {
            listeners.remove(name);
        }
        removed
    }

    /// Invoke every listener for `name`, dropping `once` listeners first.
    /// Returns how many listeners ran.
    pub(crate) fn emit(&self, name: &str, payload: &Value) -> usize {
        let targets: Vec<EventListener> = {
            let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
            let Some(entries) = listeners.get_mut(name) else {
                return 0;
            };
            let targets = entries.iter().map(|entry| entry.listener.clone()).collect();
            entries.retain(|entry| !entry.once);
            if entries.is_empty() {
                listeners.remove(name);
            }
            targets
        };
        for listener in &targets {
            listener(payload);
        }
        targets.len()
    }

    pub(crate) fn listener_count(&self, name: &str) -> usize {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(name).map_or(0, Vec::len)
    }

    pub(crate) fn clear(&self) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.clear();
    }
}
