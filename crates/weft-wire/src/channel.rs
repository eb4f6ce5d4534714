//! Channel: the protocol node.
//!
//! A [`Channel`] owns a set of pipes and a topology table. When a pipe is
//! attached the channel announces itself with a handshake; peers merge the
//! announcement, and every topology change is re-gossiped on all pipes so
//! reachability spreads across multi-hop trees. Messages whose destination
//! is another channel are proxied one hop closer; messages addressed here
//! are dispatched as events, call responses, or calls to registered
//! handlers.
//!
//! Cyclic pipe wiring is not supported: the gossip flood has no cycle
//! detection and the only loop guard on messages is `proxiedBy`, which
//! stops a single immediate bounce.

use crate::config::ChannelConfig;
use crate::error::{ChannelError, ChannelResult, RemoteFailure};
use crate::events::{EventListener, EventRegistry, ListenerId};
use crate::message::{Departure, Handshake, Message, MessageKind, ReservedEvents};
use crate::nonce::{NonceSource, RandomNonce};
use crate::pipe::{Pipe, PipeId};
use crate::topology::{Edge, Merge, Topology};

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};

/// An async call handler: receives the call's `data`, yields the reply.
pub type CallHandler =
    Arc<dyn Fn(Value) -> BoxFuture<'static, Result<Value, RemoteFailure>> + Send + Sync>;

/// What happened to a message handed to [`Channel::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendOutcome {
    /// Emitted toward the destination through the named peer.
    Routed { via: String },
    /// Addressed to this channel and dispatched locally.
    Local,
    /// No route is known; the message was dropped.
    NoRoute,
}

/// Snapshot of a channel's protocol counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelStats {
    pub handshakes_received: u64,
    pub topology_changes: u64,
    pub messages_proxied: u64,
    pub dropped_no_route: u64,
    pub bounces_dropped: u64,
    pub late_responses: u64,
    pub unanswered_calls: u64,
}

#[derive(Default)]
struct Counters {
    handshakes_received: AtomicU64,
    topology_changes: AtomicU64,
    messages_proxied: AtomicU64,
    dropped_no_route: AtomicU64,
    bounces_dropped: AtomicU64,
    late_responses: AtomicU64,
    unanswered_calls: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> ChannelStats {
        ChannelStats {
            handshakes_received: self.handshakes_received.load(Ordering::Relaxed),
            topology_changes: self.topology_changes.load(Ordering::Relaxed),
            messages_proxied: self.messages_proxied.load(Ordering::Relaxed),
            dropped_no_route: self.dropped_no_route.load(Ordering::Relaxed),
            bounces_dropped: self.bounces_dropped.load(Ordering::Relaxed),
            late_responses: self.late_responses.load(Ordering::Relaxed),
            unanswered_calls: self.unanswered_calls.load(Ordering::Relaxed),
        }
    }
}

struct PendingCall {
    name: String,
    tx: oneshot::Sender<ChannelResult<Value>>,
}

struct AttachedPipe {
    id: PipeId,
    pipe: Arc<dyn Pipe>,
}

struct ChannelInner {
    config: ChannelConfig,
    events: ReservedEvents,
    destroyed: AtomicBool,
    pipes: RwLock<Vec<AttachedPipe>>,
    next_pipe_id: AtomicU64,
    topology: RwLock<Topology>,
    /// Bumped on every topology change; route waiters watch it.
    topology_version: watch::Sender<u64>,
    pending: DashMap<String, PendingCall>,
    handlers: DashMap<String, CallHandler>,
    listeners: EventRegistry,
    nonces: Box<dyn NonceSource>,
    counters: Counters,
}

/// A network node. Cheap to clone; clones share the same node.
#[derive(Clone)]
pub struct Channel {
    inner: Arc<ChannelInner>,
}

impl Channel {
    /// Create a channel with random call nonces.
    pub fn new(config: ChannelConfig) -> Self {
        Self::with_nonce_source(config, RandomNonce)
    }

    /// Create a channel drawing call nonces from `nonces`.
    pub fn with_nonce_source(config: ChannelConfig, nonces: impl NonceSource) -> Self {
        let (topology_version, _) = watch::channel(0);
        Self {
            inner: Arc::new(ChannelInner {
                events: ReservedEvents::new(&config.namespace),
                topology: RwLock::new(Topology::new(config.id.clone())),
                config,
                destroyed: AtomicBool::new(false),
                pipes: RwLock::new(Vec::new()),
                next_pipe_id: AtomicU64::new(0),
                topology_version,
                pending: DashMap::new(),
                handlers: DashMap::new(),
                listeners: EventRegistry::default(),
                nonces: Box::new(nonces),
                counters: Counters::default(),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.id
    }

    pub fn config(&self) -> &ChannelConfig {
        &self.inner.config
    }

    /// Reserved event names used by this channel.
    pub fn reserved_events(&self) -> &ReservedEvents {
        &self.inner.events
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::Acquire)
    }

    fn ensure_alive(&self) -> ChannelResult<()> {
        if self.is_destroyed() {
            Err(ChannelError::Destroyed)
        } else {
            Ok(())
        }
    }

    /// Attach a pipe, subscribe to the reserved events on it and announce
    /// this channel through it.
    pub fn add_pipe<P: Pipe>(&self, pipe: P) -> ChannelResult<PipeId> {
        self.ensure_alive()?;

        let id = PipeId(self.inner.next_pipe_id.fetch_add(1, Ordering::Relaxed));
        let pipe: Arc<dyn Pipe> = Arc::new(pipe);
        {
            let mut pipes = self.inner.pipes.write().unwrap_or_else(|e| e.into_inner());
            pipes.push(AttachedPipe {
                id,
                pipe: Arc::clone(&pipe),
            });
        }

        let events = &self.inner.events;
        pipe.listen(
            &events.handshake,
            self.pipe_listener(id, |channel, pipe, payload| {
                match serde_json::from_value::<Handshake>(payload) {
                    Ok(handshake) => {
                        channel.handle_handshake(pipe, handshake);
                    }
                    Err(e) => warn!(channel = %channel.id(), %pipe, error = %e, "Undecodable handshake"),
                }
            }),
        );
        pipe.listen(
            &events.message,
            self.pipe_listener(id, |channel, pipe, payload| {
                match serde_json::from_value::<Message>(payload) {
                    Ok(message) => channel.handle_message(pipe, message),
                    Err(e) => warn!(channel = %channel.id(), %pipe, error = %e, "Undecodable message"),
                }
            }),
        );
        pipe.listen(
            &events.depart,
            self.pipe_listener(id, |channel, pipe, payload| {
                match serde_json::from_value::<Departure>(payload) {
                    Ok(departure) => {
                        channel.handle_departure(pipe, departure);
                    }
                    Err(e) => warn!(channel = %channel.id(), %pipe, error = %e, "Undecodable departure"),
                }
            }),
        );

        info!(channel = %self.id(), %id, "Pipe attached");
        self.emit_handshake(id, pipe.as_ref());
        Ok(id)
    }

    /// Wrap a payload handler so the pipe never keeps the channel alive.
    fn pipe_listener(
        &self,
        pipe: PipeId,
        handle: fn(&Channel, PipeId, Value),
    ) -> crate::pipe::Listener {
        let weak: Weak<ChannelInner> = Arc::downgrade(&self.inner);
        Arc::new(move |payload| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            let channel = Channel { inner };
            if !channel.is_destroyed() {
                handle(&channel, pipe, payload);
            }
        })
    }

    pub fn pipe_count(&self) -> usize {
        let pipes = self.inner.pipes.read().unwrap_or_else(|e| e.into_inner());
        pipes.len()
    }

    fn pipe(&self, id: PipeId) -> Option<Arc<dyn Pipe>> {
        let pipes = self.inner.pipes.read().unwrap_or_else(|e| e.into_inner());
        pipes
            .iter()
            .find(|attached| attached.id == id)
            .map(|attached| Arc::clone(&attached.pipe))
    }

    fn pipes_snapshot(&self) -> Vec<(PipeId, Arc<dyn Pipe>)> {
        let pipes = self.inner.pipes.read().unwrap_or_else(|e| e.into_inner());
        pipes
            .iter()
            .map(|attached| (attached.id, Arc::clone(&attached.pipe)))
            .collect()
    }

    fn emit_handshake(&self, id: PipeId, pipe: &dyn Pipe) {
        let channel_ids = {
            let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
            topology.advertised_ids(id)
        };
        let handshake = Handshake {
            id: self.id().to_string(),
            channel_ids,
        };
        match serde_json::to_value(&handshake) {
            Ok(payload) => pipe.emit(&self.inner.events.handshake, payload),
            Err(e) => warn!(channel = %self.id(), error = %e, "Failed to encode handshake"),
        }
    }

    /// Re-announce this channel on every attached pipe.
    pub fn broadcast_handshake(&self) {
        if self.is_destroyed() {
            return;
        }
        for (id, pipe) in self.pipes_snapshot() {
            self.emit_handshake(id, pipe.as_ref());
        }
    }

    /// Merge a peer's handshake that arrived on `pipe`.
    ///
    /// Any topology change fires the local edge-discovered event and floods
    /// a fresh handshake on every pipe.
    pub fn handle_handshake(&self, pipe: PipeId, handshake: Handshake) -> Merge {
        if self.is_destroyed() {
            return Merge::Unchanged;
        }
        Counters::bump(&self.inner.counters.handshakes_received);

        let merge = {
            let mut topology = self.inner.topology.write().unwrap_or_else(|e| e.into_inner());
            topology.merge(pipe, &handshake)
        };

        if merge.changed() {
            debug!(channel = %self.id(), peer = %handshake.id, %pipe, merge = ?merge, "Topology changed");
            self.topology_changed(&handshake.id);
        } else {
            debug!(channel = %self.id(), peer = %handshake.id, "Handshake carried nothing new");
        }
        merge
    }

    fn topology_changed(&self, peer: &str) {
        Counters::bump(&self.inner.counters.topology_changes);
        self.inner.topology_version.send_modify(|version| *version += 1);
        self.inner
            .listeners
            .emit(&self.inner.events.edge_discovered, &Value::String(peer.to_string()));
        self.broadcast_handshake();
    }

    /// Retire ids announced as gone by the peer behind `pipe`.
    ///
    /// Returns the ids this channel can no longer reach. They are forwarded
    /// on every other pipe so the departure spreads through the tree.
    pub fn handle_departure(&self, pipe: PipeId, departure: Departure) -> Vec<String> {
        if self.is_destroyed() {
            return Vec::new();
        }
        let lost = {
            let mut topology = self.inner.topology.write().unwrap_or_else(|e| e.into_inner());
            topology.retire(pipe, &departure.channel_ids)
        };
        if lost.is_empty() {
            return lost;
        }

        info!(channel = %self.id(), from = %departure.id, lost = ?lost, "Channels departed");
        self.inner.topology_version.send_modify(|version| *version += 1);
        for id in &lost {
            self.inner
                .listeners
                .emit(&self.inner.events.edge_lost, &Value::String(id.clone()));
        }

        let notice = Departure {
            id: self.id().to_string(),
            channel_ids: lost.clone(),
        };
        match serde_json::to_value(&notice) {
            Ok(payload) => {
                for (id, other) in self.pipes_snapshot() {
                    if id != pipe {
                        other.emit(&self.inner.events.depart, payload.clone());
                    }
                }
            }
            Err(e) => warn!(channel = %self.id(), error = %e, "Failed to encode departure"),
        }
        lost
    }

    /// The directly known peer through which `destination` is reachable.
    pub fn find_edge_id(&self, destination: &str) -> Option<String> {
        let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
        topology.find_edge_id(destination)
    }

    /// Wait until a route to `destination` is known and return the peer it
    /// goes through. Resolves immediately if a route already exists.
    pub async fn wait_for_edge(&self, destination: &str) -> ChannelResult<String> {
        let mut changes = self.inner.topology_version.subscribe();
        loop {
            self.ensure_alive()?;
            if let Some(edge) = self.find_edge_id(destination) {
                return Ok(edge);
            }
            if changes.changed().await.is_err() {
                return Err(ChannelError::Destroyed);
            }
        }
    }

    /// Snapshot of the directly known peers.
    pub fn edges(&self) -> Vec<Edge> {
        let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
        topology.edges()
    }

    pub fn edge_count(&self) -> usize {
        let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
        topology.len()
    }

    /// Every channel id this channel can currently route to.
    pub fn reachable_ids(&self) -> Vec<String> {
        let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
        topology.reachable_ids().into_iter().collect()
    }

    /// Fire-and-forget. Stamps the source and emits toward the destination.
    ///
    /// An unroutable message is dropped and counted, not treated as an error.
    pub fn send(&self, mut message: Message) -> ChannelResult<SendOutcome> {
        self.ensure_alive()?;
        message.source = self.id().to_string();
        if message.destination == self.id() {
            self.deliver(message);
            return Ok(SendOutcome::Local);
        }
        self.route(message)
    }

    /// Send a fire-and-forget event to `destination`'s listeners for `name`.
    pub fn notify(
        &self,
        destination: &str,
        name: &str,
        data: impl Serialize,
    ) -> ChannelResult<SendOutcome> {
        let data = serde_json::to_value(data)?;
        self.send(Message::new(destination, name, data))
    }

    /// Peer id and pipe of the next hop toward `destination`.
    fn next_hop(&self, destination: &str) -> Option<(String, PipeId, Arc<dyn Pipe>)> {
        let (edge, id) = {
            let topology = self.inner.topology.read().unwrap_or_else(|e| e.into_inner());
            let edge = topology.find_edge_id(destination)?;
            let id = topology.pipe_of(&edge)?;
            (edge, id)
        };
        self.pipe(id).map(|pipe| (edge, id, pipe))
    }

    fn drop_unroutable(&self, message: &Message) {
        Counters::bump(&self.inner.counters.dropped_no_route);
        warn!(
            channel = %self.id(),
            destination = %message.destination,
            name = %message.name,
            "No route to destination, dropping message"
        );
    }

    fn route(&self, message: Message) -> ChannelResult<SendOutcome> {
        let Some((via, _, pipe)) = self.next_hop(&message.destination) else {
            self.drop_unroutable(&message);
            return Ok(SendOutcome::NoRoute);
        };
        let payload = serde_json::to_value(&message)?;
        pipe.emit(&self.inner.events.message, payload);
        Ok(SendOutcome::Routed { via })
    }

    /// Route or dispatch a message that arrived on `pipe`.
    pub fn handle_message(&self, pipe: PipeId, mut message: Message) {
        if self.is_destroyed() {
            return;
        }
        if message.proxied_by.as_deref() == Some(self.id()) {
            Counters::bump(&self.inner.counters.bounces_dropped);
            debug!(channel = %self.id(), %pipe, name = %message.name, "Dropping bounced message");
            return;
        }
        if message.destination == self.id() {
            self.deliver(message);
            return;
        }

        let Some((via, hop, next)) = self.next_hop(&message.destination) else {
            self.drop_unroutable(&message);
            return;
        };
        // On a shared broadcast pipe the destination already heard it.
        if hop == pipe {
            Counters::bump(&self.inner.counters.bounces_dropped);
            debug!(
                channel = %self.id(),
                %pipe,
                destination = %message.destination,
                "Destination sits behind the arrival pipe, not forwarding"
            );
            return;
        }

        message.proxied_by = Some(self.id().to_string());
        Counters::bump(&self.inner.counters.messages_proxied);
        debug!(
            channel = %self.id(),
            destination = %message.destination,
            %via,
            name = %message.name,
            "Proxying message"
        );
        match serde_json::to_value(&message) {
            Ok(payload) => next.emit(&self.inner.events.message, payload),
            Err(e) => warn!(channel = %self.id(), error = %e, "Failed to encode proxied message"),
        }
    }

    fn deliver(&self, message: Message) {
        match message.kind() {
            MessageKind::Event => self.deliver_event(message),
            MessageKind::Response => self.deliver_response(message),
            MessageKind::Call if self.answers_pending_call(&message) => {
                self.deliver_response(message)
            }
            MessageKind::Call => self.deliver_call(message),
        }
    }

    /// A reply from a peer that does not set `isResponse` is still matched
    /// by nonce. Calls to ourselves share the nonce with their own pending
    /// entry, so they are excluded.
    fn answers_pending_call(&self, message: &Message) -> bool {
        message.source != self.id()
            && message
                .nonce
                .as_deref()
                .is_some_and(|nonce| self.inner.pending.contains_key(nonce))
    }

    fn deliver_event(&self, message: Message) {
        if self.inner.events.is_reserved(&message.name) {
            debug!(channel = %self.id(), name = %message.name, "Ignoring remote event in reserved namespace");
            return;
        }
        let delivered = self.inner.listeners.emit(&message.name, &message.data);
        debug!(channel = %self.id(), name = %message.name, listeners = delivered, "Event delivered");
    }

    fn deliver_response(&self, message: Message) {
        let Some(nonce) = message.nonce.as_deref() else {
            return;
        };
        let Some((_, call)) = self.inner.pending.remove(nonce) else {
            Counters::bump(&self.inner.counters.late_responses);
            debug!(channel = %self.id(), %nonce, name = %message.name, "Dropping response with no pending call");
            return;
        };
        let result = match message.error {
            Some(failure) => Err(ChannelError::Remote(failure)),
            None => Ok(message.data),
        };
        if call.tx.send(result).is_err() {
            debug!(channel = %self.id(), name = %call.name, "Caller went away before the response");
        }
    }

    fn deliver_call(&self, mut message: Message) {
        let handler = self
            .inner
            .handlers
            .get(&message.name)
            .map(|entry| Arc::clone(entry.value()));
        let Some(handler) = handler else {
            Counters::bump(&self.inner.counters.unanswered_calls);
            debug!(channel = %self.id(), name = %message.name, source = %message.source, "No handler registered, call left unanswered");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            Counters::bump(&self.inner.counters.unanswered_calls);
            warn!(channel = %self.id(), name = %message.name, "No tokio runtime to run handler, call dropped");
            return;
        };

        let channel = self.clone();
        let data = std::mem::take(&mut message.data);
        runtime.spawn(async move {
            let outcome = handler(data).await;
            if let Err(failure) = &outcome {
                debug!(channel = %channel.id(), name = %message.name, error = %failure, "Handler failed");
            }
            if let Err(e) = channel.send(message.reply(outcome)) {
                debug!(channel = %channel.id(), name = %message.name, error = %e, "Could not send response");
            }
        });
    }

    /// Issue a call with the configured default deadline.
    pub async fn call(&self, message: Message) -> ChannelResult<Value> {
        self.call_with_timeout(message, self.inner.config.call_timeout())
            .await
    }

    /// Issue a call and wait for the correlated response.
    ///
    /// Fails with `Timeout` if nothing arrives within `timeout`, and with
    /// `Remote` if the handler on the far side failed.
    pub async fn call_with_timeout(
        &self,
        mut message: Message,
        timeout: Duration,
    ) -> ChannelResult<Value> {
        self.ensure_alive()?;

        let nonce = self.inner.nonces.next_nonce();
        let (tx, rx) = oneshot::channel();
        self.inner.pending.insert(
            nonce.clone(),
            PendingCall {
                name: message.name.clone(),
                tx,
            },
        );

        let name = message.name.clone();
        message.nonce = Some(nonce.clone());
        message.is_response = false;
        message.error = None;
        message.proxied_by = None;
        if let Err(e) = self.send(message) {
            self.inner.pending.remove(&nonce);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ChannelError::Destroyed),
            Err(_) => {
                self.inner.pending.remove(&nonce);
                debug!(channel = %self.id(), %nonce, %name, "Call timed out");
                Err(ChannelError::Timeout {
                    name,
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Number of calls awaiting a response.
    pub fn pending_calls(&self) -> usize {
        self.inner.pending.len()
    }

    pub fn has_pending_call(&self, nonce: &str) -> bool {
        self.inner.pending.contains_key(nonce)
    }

    /// Register the handler for calls named `name`, replacing any previous one.
    pub fn register_handler(&self, name: impl Into<String>, handler: CallHandler) {
        let name = name.into();
        if self.inner.handlers.insert(name.clone(), handler).is_some() {
            debug!(channel = %self.id(), %name, "Replaced call handler");
        }
    }

    /// Register an async closure as the handler for `name`.
    pub fn on_call<F, Fut>(&self, name: impl Into<String>, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, RemoteFailure>> + Send + 'static,
    {
        let handler: CallHandler = Arc::new(move |data| handler(data).boxed());
        self.register_handler(name, handler);
    }

    /// Remove the handler for `name`. Returns whether one was registered.
    pub fn remove_handler(&self, name: &str) -> bool {
        self.inner.handlers.remove(name).is_some()
    }

    pub fn has_handler(&self, name: &str) -> bool {
        self.inner.handlers.contains_key(name)
    }

    /// Subscribe to local events named `name`.
    pub fn on<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(listener);
        self.inner.listeners.on(name, listener)
    }

    /// Subscribe to the next local event named `name` only.
    pub fn once<F>(&self, name: &str, listener: F) -> ListenerId
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        let listener: EventListener = Arc::new(listener);
        self.inner.listeners.once(name, listener)
    }

    pub fn off(&self, name: &str, id: ListenerId) -> bool {
        self.inner.listeners.off(name, id)
    }

    /// Deliver an event to this channel's own listeners.
    pub fn emit_local<T: Serialize>(&self, name: &str, data: T) -> ChannelResult<usize> {
        let data = serde_json::to_value(data)?;
        Ok(self.inner.listeners.emit(name, &data))
    }

    pub fn listener_count(&self, name: &str) -> usize {
        self.inner.listeners.listener_count(name)
    }

    /// Called with the peer id whenever this channel's topology grows.
    pub fn on_edge<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = self.inner.events.edge_discovered.clone();
        self.on(&name, move |payload| {
            if let Some(peer) = payload.as_str() {
                listener(peer);
            }
        })
    }

    /// Called with each channel id that became unreachable.
    pub fn on_edge_lost<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        let name = self.inner.events.edge_lost.clone();
        self.on(&name, move |payload| {
            if let Some(id) = payload.as_str() {
                listener(id);
            }
        })
    }

    pub fn stats(&self) -> ChannelStats {
        self.inner.counters.snapshot()
    }

    /// Tear the channel down.
    ///
    /// Neighbours are told this channel departed, pending calls fail with
    /// `Destroyed`, and every later operation fails fast.
    pub fn destroy(&self) {
        if self.inner.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let pipes: Vec<AttachedPipe> = {
            let mut pipes = self.inner.pipes.write().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *pipes)
        };
        let notice = Departure {
            id: self.id().to_string(),
            channel_ids: vec![self.id().to_string()],
        };
        match serde_json::to_value(&notice) {
            Ok(payload) => {
                for attached in &pipes {
                    attached.pipe.emit(&self.inner.events.depart, payload.clone());
                }
            }
            Err(e) => warn!(channel = %self.id(), error = %e, "Failed to encode departure"),
        }

        {
            let mut topology = self.inner.topology.write().unwrap_or_else(|e| e.into_inner());
            topology.clear();
        }
        self.inner.handlers.clear();
        self.inner.listeners.clear();

        let nonces: Vec<String> = self
            .inner
            .pending
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        for nonce in nonces {
            if let Some((_, call)) = self.inner.pending.remove(&nonce) {
                let _ = call.tx.send(Err(ChannelError::Destroyed));
            }
        }
        self.inner.topology_version.send_modify(|version| *version += 1);

        info!(channel = %self.id(), pipes = pipes.len(), "Channel destroyed");
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("id", &self.id())
            .field("pipes", &self.pipe_count())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nonce::CounterNonce;
    use crate::pipe::Listener;
    use serde_json::json;
    use std::sync::Mutex;
    use tokio_test::{assert_pending, assert_ready};

    /// Pipe double that records emissions and keeps listeners for injection.
    #[derive(Clone, Default)]
    struct RecordingPipe {
        emitted: Arc<Mutex<Vec<(String, Value)>>>,
        listeners: Arc<Mutex<Vec<(String, Listener)>>>,
    }

    impl RecordingPipe {
        fn emitted(&self, event: &str) -> Vec<Value> {
            self.emitted
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == event)
                .map(|(_, payload)| payload.clone())
                .collect()
        }

        fn inject(&self, event: &str, payload: Value) {
            let listeners: Vec<Listener> = self
                .listeners
                .lock()
                .unwrap()
                .iter()
                .filter(|(name, _)| name == event)
                .map(|(_, listener)| listener.clone())
                .collect();
            for listener in listeners {
                listener(payload.clone());
            }
        }
    }

    impl Pipe for RecordingPipe {
        fn emit(&self, event: &str, payload: Value) {
            self.emitted
                .lock()
                .unwrap()
                .push((event.to_string(), payload));
        }

        fn listen(&self, event: &str, listener: Listener) {
            self.listeners
                .lock()
                .unwrap()
                .push((event.to_string(), listener));
        }
    }

    fn channel(id: &str) -> Channel {
        Channel::with_nonce_source(ChannelConfig::with_id(id), CounterNonce::new(id))
    }

    fn hs(id: &str, ids: &[&str]) -> Handshake {
        Handshake {
            id: id.to_string(),
            channel_ids: ids.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Channel `id` with one recording pipe on which `peer` has announced `behind`.
    fn with_peer(id: &str, peer: &str, behind: &[&str]) -> (Channel, RecordingPipe, PipeId) {
        let ch = channel(id);
        let pipe = RecordingPipe::default();
        let pipe_id = ch.add_pipe(pipe.clone()).unwrap();
        ch.handle_handshake(pipe_id, hs(peer, behind));
        (ch, pipe, pipe_id)
    }

    #[test]
    fn test_add_pipe_announces_channel() {
        let ch = channel("a");
        let pipe = RecordingPipe::default();
        ch.add_pipe(pipe.clone()).unwrap();

        assert_eq!(ch.pipe_count(), 1);
        assert_eq!(
            pipe.emitted("weft:handshake"),
            vec![json!({ "id": "a", "channelIds": [] })]
        );
        let events: Vec<String> = pipe
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(name, _)| name.clone())
            .collect();
        assert_eq!(events, vec!["weft:handshake", "weft:message", "weft:depart"]);
    }

    #[test]
    fn test_handshake_through_pipe_listener() {
        let ch = channel("a");
        let pipe = RecordingPipe::default();
        ch.add_pipe(pipe.clone()).unwrap();

        pipe.inject("weft:handshake", json!({ "id": "b", "channelIds": ["c"] }));
        assert_eq!(ch.find_edge_id("c").as_deref(), Some("b"));

        // Garbage is logged and ignored.
        pipe.inject("weft:handshake", json!({ "nope": true }));
        assert_eq!(ch.edges().len(), 1);
    }

    #[test]
    fn test_self_handshake_ignored() {
        let ch = channel("a");
        let pipe = RecordingPipe::default();
        let id = ch.add_pipe(pipe.clone()).unwrap();

        assert_eq!(ch.handle_handshake(id, hs("a", &["x"])), Merge::SelfAnnounce);
        assert!(ch.edges().is_empty());
        assert_eq!(pipe.emitted("weft:handshake").len(), 1);
    }

    #[test]
    fn test_new_peer_triggers_gossip_on_every_pipe() {
        let ch = channel("b");
        let left = RecordingPipe::default();
        let right = RecordingPipe::default();
        let left_id = ch.add_pipe(left.clone()).unwrap();
        ch.add_pipe(right.clone()).unwrap();

        let discovered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&discovered);
        ch.on_edge(move |peer| sink.lock().unwrap().push(peer.to_string()));

        assert_eq!(ch.handle_handshake(left_id, hs("a", &[])), Merge::Discovered);
        assert_eq!(*discovered.lock().unwrap(), vec!["a"]);

        // Split horizon: the left pipe does not hear about "a" again.
        let left_hs = left.emitted("weft:handshake");
        assert_eq!(left_hs.last().unwrap(), &json!({ "id": "b", "channelIds": [] }));
        let right_hs = right.emitted("weft:handshake");
        assert_eq!(right_hs.last().unwrap(), &json!({ "id": "b", "channelIds": ["a"] }));
    }

    #[test]
    fn test_redelivered_handshake_is_noop() {
        let (ch, pipe, pipe_id) = with_peer("a", "b", &["c"]);
        let edges_before = ch.edges();
        let emitted_before = pipe.emitted("weft:handshake").len();

        assert_eq!(ch.handle_handshake(pipe_id, hs("b", &["c"])), Merge::Unchanged);
        assert_eq!(ch.handle_handshake(pipe_id, hs("b", &["a"])), Merge::Unchanged);

        assert_eq!(ch.edges(), edges_before);
        assert_eq!(ch.edge_count(), 1);
        assert_eq!(pipe.emitted("weft:handshake").len(), emitted_before);
        assert_eq!(ch.stats().topology_changes, 1);
    }

    #[test]
    fn test_extended_handshake_unions_ids() {
        let (ch, _pipe, pipe_id) = with_peer("a", "b", &["c"]);
        assert_eq!(
            ch.handle_handshake(pipe_id, hs("b", &["d"])),
            Merge::Extended(vec!["d".to_string()])
        );
        assert_eq!(ch.reachable_ids(), vec!["b", "c", "d"]);
    }

    #[test]
    fn test_send_routes_through_peer() {
        let (ch, pipe, _) = with_peer("a", "b", &["c"]);

        let outcome = ch.send(Message::new("c", "greet", json!("hi"))).unwrap();
        assert_eq!(outcome, SendOutcome::Routed { via: "b".to_string() });

        let sent = pipe.emitted("weft:message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["source"], "a");
        assert_eq!(sent[0]["destination"], "c");
        assert!(sent[0].get("nonce").is_none());
    }

    #[test]
    fn test_send_without_route_is_dropped() {
        let ch = channel("a");
        let outcome = ch.send(Message::new("ghost", "greet", json!(null))).unwrap();
        assert_eq!(outcome, SendOutcome::NoRoute);
        assert_eq!(ch.stats().dropped_no_route, 1);
    }

    #[test]
    fn test_proxy_stamps_proxied_by() {
        let (b, right, right_id) = with_peer("b", "c", &[]);
        let left = RecordingPipe::default();
        let left_id = b.add_pipe(left.clone()).unwrap();
        b.handle_handshake(left_id, hs("a", &[]));
        assert_ne!(left_id, right_id);

        let mut msg = Message::new("c", "greet", json!(1));
        msg.source = "a".to_string();
        b.handle_message(left_id, msg);

        let sent = right.emitted("weft:message");
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0]["proxiedBy"], "b");
        assert_eq!(sent[0]["source"], "a");
        assert_eq!(b.stats().messages_proxied, 1);
        assert!(left.emitted("weft:message").is_empty());
    }

    #[test]
    fn test_no_forwarding_back_out_arrival_pipe() {
        let (b, pipe, pipe_id) = with_peer("b", "c", &[]);

        let mut msg = Message::new("c", "greet", json!(1));
        msg.source = "a".to_string();
        b.handle_message(pipe_id, msg);

        assert!(pipe.emitted("weft:message").is_empty());
        assert_eq!(b.stats().messages_proxied, 0);
        assert_eq!(b.stats().bounces_dropped, 1);
    }

    #[test]
    fn test_bounced_message_dropped() {
        let (b, pipe, pipe_id) = with_peer("b", "c", &[]);

        let mut msg = Message::new("c", "greet", json!(1));
        msg.source = "a".to_string();
        msg.proxied_by = Some("b".to_string());
        b.handle_message(pipe_id, msg);

        assert!(pipe.emitted("weft:message").is_empty());
        assert_eq!(b.stats().bounces_dropped, 1);
        assert_eq!(b.stats().messages_proxied, 0);
    }

    #[test]
    fn test_event_dispatch_to_listeners() {
        let ch = channel("a");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let id = ch.on("greet", move |payload| sink.lock().unwrap().push(payload.clone()));

        let once_count = Arc::new(AtomicU64::new(0));
        let once_sink = Arc::clone(&once_count);
        ch.once("greet", move |_| {
            once_sink.fetch_add(1, Ordering::SeqCst);
        });

        let mut msg = Message::new("a", "greet", json!("hello"));
        msg.source = "b".to_string();
        ch.handle_message(PipeId(0), msg.clone());
        ch.handle_message(PipeId(0), msg.clone());
        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(once_count.load(Ordering::SeqCst), 1);

        assert!(ch.off("greet", id));
        ch.handle_message(PipeId(0), msg);
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_remote_event_in_reserved_namespace_ignored() {
        let ch = channel("a");
        let fired = Arc::new(AtomicBool::new(false));
        let sink = Arc::clone(&fired);
        ch.on_edge(move |_| sink.store(true, Ordering::SeqCst));

        ch.handle_message(PipeId(0), Message::new("a", "weft:edge", json!("spoofed")));
        assert!(!fired.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_response_correlation() {
        let (ch, pipe, pipe_id) = with_peer("a", "b", &[]);

        let mut call = tokio_test::task::spawn(
            ch.call_with_timeout(Message::new("b", "ping", json!([1])), Duration::from_secs(5)),
        );
        assert_pending!(call.poll());
        assert!(ch.has_pending_call("a:1"));
        let request = pipe.emitted("weft:message").pop().unwrap();
        assert_eq!(request["nonce"], "a:1");

        let mut wrong = Message::new("a", "ping", json!(99));
        wrong.source = "b".to_string();
        wrong.nonce = Some("a:42".to_string());
        wrong.is_response = true;
        ch.handle_message(pipe_id, wrong);
        assert_pending!(call.poll());
        assert_eq!(ch.stats().late_responses, 1);

        let mut right = Message::new("a", "ping", json!(2));
        right.source = "b".to_string();
        right.nonce = Some("a:1".to_string());
        right.is_response = true;
        ch.handle_message(pipe_id, right);

        assert!(call.is_woken());
        let result = assert_ready!(call.poll());
        assert_eq!(result.unwrap(), json!(2));
        assert_eq!(ch.pending_calls(), 0);
    }

    #[tokio::test]
    async fn test_unmarked_response_resolves_pending_call() {
        let (ch, pipe, _) = with_peer("a", "b", &[]);
        let local_ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&local_ran);
        ch.on_call("ping", move |_| {
            flag.store(true, Ordering::SeqCst);
            async { Ok(json!("local-handler-ran")) }
        });

        let mut call = tokio_test::task::spawn(
            ch.call_with_timeout(Message::new("b", "ping", json!([1])), Duration::from_secs(5)),
        );
        assert_pending!(call.poll());
        let sent_before = pipe.emitted("weft:message").len();

        pipe.inject(
            "weft:message",
            json!({
                "name": "ping",
                "source": "b",
                "destination": "a",
                "data": 2,
                "nonce": "a:1"
            }),
        );

        assert!(call.is_woken());
        assert_eq!(assert_ready!(call.poll()).unwrap(), json!(2));
        assert_eq!(ch.pending_calls(), 0);
        assert_eq!(pipe.emitted("weft:message").len(), sent_before);
        assert!(!local_ran.load(Ordering::SeqCst));
        assert_eq!(ch.stats().unanswered_calls, 0);
    }

    #[tokio::test]
    async fn test_error_response_rejects_call() {
        let (ch, _pipe, pipe_id) = with_peer("a", "b", &[]);
        let mut call = tokio_test::task::spawn(
            ch.call_with_timeout(Message::new("b", "explode", json!([])), Duration::from_secs(5)),
        );
        assert_pending!(call.poll());

        let mut request = Message::new("b", "explode", json!([]));
        request.source = "a".to_string();
        request.nonce = Some("a:1".to_string());
        let mut reply = request.reply(Err(RemoteFailure::new("Error", "kaboom")));
        reply.source = "b".to_string();
        ch.handle_message(pipe_id, reply);

        match assert_ready!(call.poll()) {
            Err(ChannelError::Remote(failure)) => assert_eq!(failure.message, "kaboom"),
            other => panic!("Expected Remote error, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out_and_clears_pending() {
        let ch = channel("a");
        let started = tokio::time::Instant::now();
        let result = ch
            .call_with_timeout(Message::new("ghost", "ping", json!([])), Duration::from_millis(50))
            .await;

        match result {
            Err(ChannelError::Timeout { name, timeout_ms }) => {
                assert_eq!(name, "ping");
                assert_eq!(timeout_ms, 50);
            }
            other => panic!("Expected Timeout, got {other:?}"),
        }
        assert_eq!(started.elapsed(), Duration::from_millis(50));
        assert!(!ch.has_pending_call("a:1"));
        assert_eq!(ch.pending_calls(), 0);
    }

    #[test]
    fn test_call_without_handler_is_unanswered() {
        let (ch, _pipe, pipe_id) = with_peer("b", "a", &[]);
        let mut call = Message::new("b", "missing", json!([]));
        call.source = "a".to_string();
        call.nonce = Some("a:1".to_string());
        ch.handle_message(pipe_id, call);
        assert_eq!(ch.stats().unanswered_calls, 1);
    }

    #[tokio::test]
    async fn test_call_to_self_runs_local_handler() {
        let ch = channel("a");
        ch.on_call("double", |data| async move {
            let n = data[0].as_i64().unwrap_or_default();
            Ok(json!(n * 2))
        });

        let result = ch.call(Message::new("a", "double", json!([21]))).await.unwrap();
        assert_eq!(result, json!(42));
    }

    #[tokio::test]
    async fn test_handler_replies_through_arrival_route() {
        let (ch, pipe, pipe_id) = with_peer("c", "b", &["a"]);
        ch.on_call("ping", |data| async move {
            Ok(json!(data[0].as_i64().unwrap_or_default() + 1))
        });

        let mut call = Message::new("c", "ping", json!([1]));
        call.source = "a".to_string();
        call.nonce = Some("a:9".to_string());
        call.proxied_by = Some("b".to_string());
        ch.handle_message(pipe_id, call);

        for _ in 0..10 {
            if !pipe.emitted("weft:message").is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        let replies = pipe.emitted("weft:message");
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0]["destination"], "a");
        assert_eq!(replies[0]["nonce"], "a:9");
        assert_eq!(replies[0]["isResponse"], true);
        assert_eq!(replies[0]["data"], 2);
    }

    #[test]
    fn test_reregistering_handler_overwrites() {
        let ch = channel("a");
        ch.on_call("ping", |_| async { Ok(json!(1)) });
        ch.on_call("ping", |_| async { Ok(json!(2)) });
        assert!(ch.has_handler("ping"));
        assert!(ch.remove_handler("ping"));
        assert!(!ch.has_handler("ping"));
    }

    #[test]
    fn test_wait_for_edge_resolves_on_discovery() {
        let ch = channel("a");
        let pipe = RecordingPipe::default();
        let pipe_id = ch.add_pipe(pipe).unwrap();

        let mut wait = tokio_test::task::spawn(ch.wait_for_edge("c"));
        assert_pending!(wait.poll());

        ch.handle_handshake(pipe_id, hs("b", &[]));
        assert_pending!(wait.poll());

        ch.handle_handshake(pipe_id, hs("b", &["c"]));
        assert!(wait.is_woken());
        assert_eq!(assert_ready!(wait.poll()).unwrap(), "b");
    }

    #[test]
    fn test_wait_for_known_edge_is_immediate() {
        let (ch, _pipe, _) = with_peer("a", "b", &[]);
        let mut wait = tokio_test::task::spawn(ch.wait_for_edge("b"));
        assert_eq!(assert_ready!(wait.poll()).unwrap(), "b");
    }

    #[test]
    fn test_departure_retires_and_forwards() {
        let ch = channel("b");
        let left = RecordingPipe::default();
        let right = RecordingPipe::default();
        let left_id = ch.add_pipe(left.clone()).unwrap();
        let right_id = ch.add_pipe(right.clone()).unwrap();
        ch.handle_handshake(left_id, hs("a", &[]));
        ch.handle_handshake(right_id, hs("c", &["d"]));

        let lost_seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&lost_seen);
        ch.on_edge_lost(move |id| sink.lock().unwrap().push(id.to_string()));

        let lost = ch.handle_departure(
            right_id,
            Departure {
                id: "c".to_string(),
                channel_ids: vec!["c".to_string()],
            },
        );
        assert_eq!(lost, vec!["c", "d"]);
        assert_eq!(*lost_seen.lock().unwrap(), vec!["c", "d"]);
        assert_eq!(ch.find_edge_id("d"), None);

        assert_eq!(
            left.emitted("weft:depart"),
            vec![json!({ "id": "b", "channelIds": ["c", "d"] })]
        );
        assert!(right.emitted("weft:depart").is_empty());
    }

    #[tokio::test]
    async fn test_destroy_fails_pending_and_later_calls() {
        let (ch, pipe, _) = with_peer("a", "b", &[]);
        let mut call = tokio_test::task::spawn(
            ch.call_with_timeout(Message::new("b", "slow", json!([])), Duration::from_secs(5)),
        );
        assert_pending!(call.poll());

        ch.destroy();
        assert!(matches!(assert_ready!(call.poll()), Err(ChannelError::Destroyed)));
        assert_eq!(ch.pending_calls(), 0);
        assert!(ch.edges().is_empty());
        assert_eq!(ch.pipe_count(), 0);
        assert_eq!(
            pipe.emitted("weft:depart"),
            vec![json!({ "id": "a", "channelIds": ["a"] })]
        );

        assert!(matches!(
            ch.call(Message::new("b", "ping", json!([]))).await,
            Err(ChannelError::Destroyed)
        ));
        assert!(matches!(
            ch.send(Message::new("b", "greet", json!(null))),
            Err(ChannelError::Destroyed)
        ));
        assert!(matches!(
            ch.add_pipe(RecordingPipe::default()),
            Err(ChannelError::Destroyed)
        ));
        assert!(matches!(ch.wait_for_edge("b").await, Err(ChannelError::Destroyed)));
    }

    #[test]
    fn test_destroyed_channel_ignores_traffic() {
        let ch = channel("a");
        let pipe = RecordingPipe::default();
        ch.add_pipe(pipe.clone()).unwrap();
        ch.destroy();

        pipe.inject("weft:handshake", json!({ "id": "b", "channelIds": [] }));
        assert!(ch.edges().is_empty());
        assert_eq!(ch.stats().handshakes_received, 0);
    }

    #[test]
    fn test_custom_namespace() {
        let mut config = ChannelConfig::with_id("a");
        config.namespace = "app".to_string();
        let ch = Channel::new(config);
        let pipe = RecordingPipe::default();
        ch.add_pipe(pipe.clone()).unwrap();

        assert_eq!(pipe.emitted("app:handshake").len(), 1);
        assert!(pipe.emitted("weft:handshake").is_empty());
        assert_eq!(ch.reserved_events().message, "app:message");
    }
}
