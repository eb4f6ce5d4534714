//! Error types for channels and remote calls.

use serde::{Deserialize, Serialize};
use std::fmt::Display;
use thiserror::Error;

/// Errors surfaced to callers of a [`Channel`](crate::Channel).
#[derive(Error, Debug)]
pub enum ChannelError {
    /// No response arrived before the call's deadline.
    #[error("Call '{name}' timed out after {timeout_ms} ms")]
    Timeout {
        /// Procedure name of the call.
        name: String,
        /// The deadline that elapsed.
        timeout_ms: u64,
    },

    /// The remote handler failed and returned an error payload.
    #[error("Remote handler failed: {0}")]
    Remote(RemoteFailure),

    /// The channel was destroyed before or while the operation ran.
    #[error("Channel destroyed")]
    Destroyed,

    /// A payload could not be converted to or from JSON.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Alias for Result with ChannelError.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// A handler failure as it travels back to the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{name}: {message}")]
pub struct RemoteFailure {
    /// Failure class, e.g. `Error` or `InvalidArguments`.
    pub name: String,
    /// Human-readable description.
    pub message: String,
}

impl RemoteFailure {
    /// Generic failure class used for handler errors.
    pub const ERROR: &'static str = "Error";
    /// The call's arguments did not match the procedure signature.
    pub const INVALID_ARGUMENTS: &'static str = "InvalidArguments";
    /// The handler's result could not be serialized.
    pub const SERIALIZATION: &'static str = "SerializationError";

    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }

    /// Wrap any displayable handler error.
    pub fn from_display(err: impl Display) -> Self {
        Self::new(Self::ERROR, err.to_string())
    }
}

impl From<ChannelError> for RemoteFailure {
    fn from(err: ChannelError) -> Self {
        match err {
            ChannelError::Remote(failure) => failure,
            other => Self::from_display(other),
        }
    }
}
