//! The pipe contract consumed by channels.
//!
//! A pipe is a named emit/listen duplex. One pipe connects exactly one local
//! channel to one remote endpoint, or to a broadcast hub such as a
//! [`Port`](crate::Port). Delivery order is whatever the carrier provides;
//! channels assume FIFO per pipe and nothing across pipes.

use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// Callback invoked with each payload received for an event.
pub type Listener = Arc<dyn Fn(Value) + Send + Sync>;

/// A duplex transport primitive.
pub trait Pipe: Send + Sync + 'static {
    /// Send `payload` to the remote side under `event`. Must not block.
    fn emit(&self, event: &str, payload: Value);

    /// Register `listener` for payloads the remote side emits under `event`.
    fn listen(&self, event: &str, listener: Listener);
}

impl<P: Pipe + ?Sized> Pipe for Arc<P> {
    fn emit(&self, event: &str, payload: Value) {
        (**self).emit(event, payload)
    }

    fn listen(&self, event: &str, listener: Listener) {
        (**self).listen(event, listener)
    }
}

/// Identifies a pipe attached to a particular channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PipeId(pub u64);

impl fmt::Display for PipeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pipe-{}", self.0)
    }
}

/// Per-event listener table shared by the pipe implementations.
#[derive(Clone, Default)]
pub(crate) struct ListenerTable {
    listeners: Arc<RwLock<HashMap<String, Vec<Listener>>>>,
}

impl ListenerTable {
    pub(crate) fn add(&self, event: &str, listener: Listener) {
        let mut listeners = self.listeners.write().unwrap_or_else(|e| e.into_inner());
        listeners.entry(event.to_string()).or_default().push(listener);
    }

    /// Snapshot the listeners for `event` so they can run without the lock.
    pub(crate) fn get(&self, event: &str) -> Vec<Listener> {
        let listeners = self.listeners.read().unwrap_or_else(|e| e.into_inner());
        listeners.get(event).cloned().unwrap_or_default()
    }

    /// Invoke every listener for `event`. Returns how many ran.
    pub(crate) fn dispatch(&self, event: &str, payload: Value) -> usize {
        let listeners = self.get(event);
        for listener in &listeners {
            listener(payload.clone());
        }
        listeners.len()
    }
}
