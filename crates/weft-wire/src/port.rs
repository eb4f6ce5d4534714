//! Port: in-process broadcast hub for co-located pipes.
//!
//! Every pipe created on a [`Port`] shares one broadcast domain: an emission
//! from any of them reaches the matching listeners of every other pipe,
//! synchronously, and never the sender itself. Nothing is buffered, so a
//! listener registered after an emission never sees it.

use crate::pipe::{Listener, ListenerTable, Pipe};
use serde_json::Value;
use std::sync::{Arc, RwLock};
use tracing::trace;

struct PortEntry {
    name: String,
    listeners: ListenerTable,
}

/// Broadcast hub handing out named pipes.
#[derive(Clone, Default)]
pub struct Port {
    entries: Arc<RwLock<Vec<PortEntry>>>,
}

impl Port {
    /// Create an empty port.
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the pipe registered under `name`, creating it on first use.
    pub fn create_pipe(&self, name: impl Into<String>) -> PortPipe {
        let name = name.into();
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let listeners = match entries.iter().find(|entry| entry.name == name) {
            Some(entry) => entry.listeners.clone(),
            None => {
                let listeners = ListenerTable::default();
                entries.push(PortEntry {
                    name: name.clone(),
                    listeners: listeners.clone(),
                });
                listeners
            }
        };
        PortPipe {
            name,
            port: self.clone(),
            listeners,
        }
    }

    /// Drop the pipe registered under `name` together with its listeners.
    ///
    /// Handles already given out stay usable but no longer receive
    /// broadcasts, and a later `create_pipe` with the same name starts
    /// with an empty listener table.
    pub fn remove_pipe(&self, name: &str) -> bool {
        let mut entries = self.entries.write().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|entry| entry.name != name);
        entries.len() != before
    }

    /// Names of all pipes registered so far, in creation order.
    pub fn pipe_names(&self) -> Vec<String> {
        let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
        entries.iter().map(|entry| entry.name.clone()).collect()
    }

    fn broadcast(&self, from: &str, event: &str, payload: Value) -> usize {
        // Collect first: listeners may re-enter the port while we deliver.
        let targets: Vec<Listener> = {
            let entries = self.entries.read().unwrap_or_else(|e| e.into_inner());
            entries
                .iter()
                .filter(|entry| entry.name != from)
                .flat_map(|entry| entry.listeners.get(event))
                .collect()
        };
        trace!(from, event, listeners = targets.len(), "Port broadcast");
        for listener in &targets {
            listener(payload.clone());
        }
        targets.len()
    }
}

/// A pipe attached to a [`Port`].
#[derive(Clone)]
pub struct PortPipe {
    name: String,
    port: Port,
    listeners: ListenerTable,
}

impl PortPipe {
    /// The name this pipe was registered under.
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Pipe for PortPipe {
    fn emit(&self, event: &str, payload: Value) {
        self.port.broadcast(&self.name, event, payload);
    }

    fn listen(&self, event: &str, listener: Listener) {
        self.listeners.add(event, listener);
    }
}
