//! Weft wire layer: decentralized messaging between execution contexts.
//!
//! Independent contexts discover each other through a gossip handshake,
//! build a partial view of the topology, and exchange fire-and-forget
//! events and request/response calls. Messages addressed to a channel that
//! is not directly connected are proxied hop by hop.
//!
//! ## Architecture
//!
//! - **Pipe**: emit/listen duplex connecting one local channel to a remote one
//! - **Port**: in-process broadcast hub multiplexing several pipes
//! - **StreamPipe**: length-prefixed JSON pipe over any async byte stream
//! - **Channel**: the protocol node (handshake, routing, call dispatch)
//! - **RemoteHost / RemoteClient**: typed procedure façades over a Channel

pub mod channel;
pub mod config;
pub mod error;
pub mod events;
pub mod message;
pub mod nonce;
pub mod pipe;
pub mod port;
pub mod remote;
pub mod stream;
pub mod topology;

pub use channel::{CallHandler, Channel, ChannelStats, SendOutcome};
pub use config::ChannelConfig;
pub use error::{ChannelError, ChannelResult, RemoteFailure};
pub use events::{EventListener, ListenerId};
pub use message::{Departure, Handshake, Message, MessageKind, ReservedEvents};
pub use nonce::{CounterNonce, NonceSource, RandomNonce};
pub use pipe::{Listener, Pipe, PipeId};
pub use port::{Port, PortPipe};
pub use remote::{procedure, HandlerMap, RemoteClient, RemoteHost, RemoteHostBuilder};
pub use stream::StreamPipe;
pub use topology::{Edge, Merge};
