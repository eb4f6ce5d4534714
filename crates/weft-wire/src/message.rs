//! Wire payload types.
//!
//! Channels exchange three payloads over their pipes, each under a reserved
//! event name derived from the channel namespace: [`Handshake`] for topology
//! gossip, [`Message`] for events, calls and responses, and [`Departure`]
//! when channels leave. Serialization is JSON with camelCase keys; framing
//! is the pipe's business.

use crate::error::RemoteFailure;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Topology gossip: the sender's id and every channel id it can reach.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Handshake {
    /// The announcing channel's id.
    pub id: String,
    /// Ids reachable through the announcing channel.
    #[serde(default)]
    pub channel_ids: Vec<String>,
}

/// Retires channel ids that are no longer reachable through the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Departure {
    /// The channel emitting the notice.
    pub id: String,
    /// Ids the receiver should stop routing through the sender.
    pub channel_ids: Vec<String>,
}

/// A unit of transit between channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Procedure or event name.
    pub name: String,
    /// Originating channel, stamped by the sender.
    #[serde(default)]
    pub source: String,
    /// Final destination channel.
    pub destination: String,
    /// Opaque payload.
    #[serde(default)]
    pub data: Value,
    /// Correlation token; absent for fire-and-forget events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    /// Last channel that forwarded (not originated) this message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proxied_by: Option<String>,
    /// Set on replies so they are never mistaken for calls.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub is_response: bool,
    /// Handler failure carried by a reply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RemoteFailure>,
}

/// How a message is dispatched at its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageKind {
    /// Fire-and-forget, delivered to local listeners.
    Event,
    /// Request expecting a correlated reply.
    Call,
    /// Reply to an earlier call.
    Response,
}

impl Message {
    /// Build a message for `destination`. The source is stamped on send.
    pub fn new(destination: impl Into<String>, name: impl Into<String>, data: Value) -> Self {
        Self {
            name: name.into(),
            source: String::new(),
            destination: destination.into(),
            data,
            nonce: None,
            proxied_by: None,
            is_response: false,
            error: None,
        }
    }

    pub fn kind(&self) -> MessageKind {
        match (&self.nonce, self.is_response) {
            (None, _) => MessageKind::Event,
            (Some(_), false) => MessageKind::Call,
            (Some(_), true) => MessageKind::Response,
        }
    }

    /// Build the reply to this call, addressed back to its source.
    pub fn reply(&self, outcome: Result<Value, RemoteFailure>) -> Message {
        let (data, error) = match outcome {
            Ok(data) => (data, None),
            Err(failure) => (Value::Null, Some(failure)),
        };
        Message {
            name: self.name.clone(),
            source: String::new(),
            destination: self.source.clone(),
            data,
            nonce: self.nonce.clone(),
            proxied_by: None,
            is_response: true,
            error,
        }
    }
}

/// Event names a channel reserves on its pipes and local registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReservedEvents {
    prefix: String,
    /// Pipe event carrying [`Handshake`] payloads.
    pub handshake: String,
    /// Pipe event carrying [`Message`] payloads.
    pub message: String,
    /// Pipe event carrying [`Departure`] payloads.
    pub depart: String,
    /// Local event fired with the peer id whenever topology grows.
    pub edge_discovered: String,
    /// Local event fired with each channel id that became unreachable.
    pub edge_lost: String,
}

impl ReservedEvents {
    pub fn new(namespace: &str) -> Self {
        let prefix = format!("{namespace}:");
        Self {
            handshake: format!("{prefix}handshake"),
            message: format!("{prefix}message"),
            depart: format!("{prefix}depart"),
            edge_discovered: format!("{prefix}edge"),
            edge_lost: format!("{prefix}edge-lost"),
            prefix,
        }
    }

    /// Whether `name` falls inside the reserved namespace.
    pub fn is_reserved(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }
}
