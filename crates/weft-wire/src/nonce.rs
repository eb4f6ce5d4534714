//! Correlation token sources for remote calls.

use std::sync::atomic::{AtomicU64, Ordering};

/// Produces the nonce attached to each outgoing call.
///
/// Nonces only need to be unique among a channel's in-flight calls; they
/// carry no security meaning.
pub trait NonceSource: Send + Sync + 'static {
    fn next_nonce(&self) -> String;
}

/// Random UUID v4 nonces. The default source.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomNonce;

impl NonceSource for RandomNonce {
    fn next_nonce(&self) -> String {
        uuid::Uuid::new_v4().simple().to_string()
    }
}

/// Deterministic `<prefix>:<n>` nonces, counting from 1.
#[derive(Debug)]
pub struct CounterNonce {
    prefix: String,
    next: AtomicU64,
}

impl CounterNonce {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: AtomicU64::new(1),
        }
    }
}

impl NonceSource for CounterNonce {
    fn next_nonce(&self) -> String {
        let n = self.next.fetch_add(1, Ordering::Relaxed);
        format!("{}:{}", self.prefix, n)
    }
}
