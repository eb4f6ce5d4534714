//! Channel configuration.
//!
//! All fields have serde defaults so a partial TOML or JSON table is enough.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Namespace prefixing the reserved pipe and local event names.
pub const DEFAULT_NAMESPACE: &str = "weft";

/// Deadline for a call when none is given explicitly.
pub const DEFAULT_CALL_TIMEOUT_MS: u64 = 10_000;

/// Configuration for a single [`Channel`](crate::Channel).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    /// This channel's unique, stable id.
    pub id: String,
    /// Prefix for reserved event names. Peers must agree on it.
    pub namespace: String,
    /// Default call deadline in milliseconds.
    pub call_timeout_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            call_timeout_ms: DEFAULT_CALL_TIMEOUT_MS,
        }
    }
}

impl ChannelConfig {
    /// Default configuration with a fixed id.
    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}
