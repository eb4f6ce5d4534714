//! Typed procedure façades over a [`Channel`].
//!
//! A [`RemoteHost`] exposes named async procedures; a [`RemoteClient`]
//! invokes them on one destination channel. Arguments travel as a JSON
//! array (a Rust tuple on both ends), results as any serde value.

use crate::channel::{CallHandler, Channel};
use crate::error::{ChannelResult, RemoteFailure};
use crate::message::Message;

use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Procedures keyed by call name.
pub type HandlerMap = HashMap<String, CallHandler>;

/// Adapt a typed async function into a [`CallHandler`].
///
/// Arguments that do not decode into `A` reject the call with an
/// `InvalidArguments` failure; a handler error is reported by its display
/// text.
pub fn procedure<A, R, E, F, Fut>(f: F) -> CallHandler
where
    A: DeserializeOwned + Send + 'static,
    R: Serialize + Send + 'static,
    E: Display + Send + 'static,
    F: Fn(A) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<R, E>> + Send + 'static,
{
    let f = Arc::new(f);
    Arc::new(move |data: Value| {
        let f = Arc::clone(&f);
        async move {
            let args: A = serde_json::from_value(data).map_err(|e| {
                RemoteFailure::new(RemoteFailure::INVALID_ARGUMENTS, e.to_string())
            })?;
            let result = f(args).await.map_err(RemoteFailure::from_display)?;
            serde_json::to_value(result)
                .map_err(|e| RemoteFailure::new(RemoteFailure::SERIALIZATION, e.to_string()))
        }
        .boxed()
    })
}

/// Serves a fixed set of procedures on a channel.
pub struct RemoteHost {
    channel: Channel,
    procedures: Vec<String>,
}

impl RemoteHost {
    /// Register every handler on `channel` and re-announce it to peers.
    pub fn new(channel: Channel, handlers: HandlerMap) -> Self {
        let mut procedures: Vec<String> = handlers.keys().cloned().collect();
        procedures.sort();
        for (name, handler) in handlers {
            channel.register_handler(name, handler);
        }
        info!(channel = %channel.id(), procedures = ?procedures, "Remote host serving");
        channel.broadcast_handshake();
        Self {
            channel,
            procedures,
        }
    }

    pub fn builder(channel: Channel) -> RemoteHostBuilder {
        RemoteHostBuilder {
            channel,
            handlers: HandlerMap::new(),
        }
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Names of the served procedures, sorted.
    pub fn procedures(&self) -> &[String] {
        &self.procedures
    }

    /// Unregister every served procedure.
    pub fn shutdown(self) {
        for name in &self.procedures {
            self.channel.remove_handler(name);
        }
        debug!(channel = %self.channel.id(), "Remote host stopped");
    }
}

/// Collects typed procedures before serving them.
pub struct RemoteHostBuilder {
    channel: Channel,
    handlers: HandlerMap,
}

impl RemoteHostBuilder {
    pub fn procedure<A, R, E, F, Fut>(mut self, name: impl Into<String>, f: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: Display + Send + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        self.handlers.insert(name.into(), procedure(f));
        self
    }

    pub fn serve(self) -> RemoteHost {
        RemoteHost::new(self.channel, self.handlers)
    }
}

/// Invokes procedures on a single remote channel.
#[derive(Clone)]
pub struct RemoteClient {
    destination: String,
    channel: Channel,
    timeout: Option<Duration>,
}

impl RemoteClient {
    pub fn new(destination: impl Into<String>, channel: Channel) -> Self {
        Self {
            destination: destination.into(),
            channel,
            timeout: None,
        }
    }

    /// Override the channel's default call deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    pub fn channel(&self) -> &Channel {
        &self.channel
    }

    /// Wait until the destination is routable. Returns the next-hop peer.
    pub async fn connect(&self) -> ChannelResult<String> {
        let via = self.channel.wait_for_edge(&self.destination).await?;
        debug!(
            channel = %self.channel.id(),
            destination = %self.destination,
            %via,
            "Remote client connected"
        );
        Ok(via)
    }

    /// Call `name` with `args` and decode the result.
    ///
    /// Pass a tuple for positional arguments: `client.run("ping", (1,))`.
    pub async fn run<R, A>(&self, name: &str, args: A) -> ChannelResult<R>
    where
        R: DeserializeOwned,
        A: Serialize,
    {
        let data = serde_json::to_value(args)?;
        let message = Message::new(self.destination.clone(), name, data);
        let value = match self.timeout {
            Some(timeout) => self.channel.call_with_timeout(message, timeout).await?,
            None => self.channel.call(message).await?,
        };
        Ok(serde_json::from_value(value)?)
    }
}
