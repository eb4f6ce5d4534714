//! Topology table: which peers this channel knows and what lies behind them.
//!
//! Knowledge only grows through handshakes: announced ids are unioned into
//! the existing [`Edge`], never replacing it. Ids are retired solely by an
//! explicit departure notice arriving on the pipe that routes them.

use crate::message::Handshake;
use crate::pipe::PipeId;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// This channel's belief about a directly connected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edge {
    /// The peer channel's id.
    pub id: String,
    /// Channel ids reachable through the peer, excluding our own id.
    pub reachable_ids: BTreeSet<String>,
    /// When the peer was first announced to us.
    pub discovered_at: DateTime<Utc>,
}

/// Outcome of merging a handshake into the table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Merge {
    /// The handshake carried our own id.
    SelfAnnounce,
    /// Everything announced was already known.
    Unchanged,
    /// A new peer was recorded.
    Discovered,
    /// A known peer gained these reachable ids.
    Extended(Vec<String>),
}

impl Merge {
    pub fn changed(&self) -> bool {
        matches!(self, Merge::Discovered | Merge::Extended(_))
    }
}

#[derive(Debug)]
pub(crate) struct Topology {
    local_id: String,
    edges: BTreeMap<String, Edge>,
    /// The pipe that first announced each peer owns routing to it.
    edge_pipes: HashMap<String, PipeId>,
}

impl Topology {
    pub(crate) fn new(local_id: impl Into<String>) -> Self {
        Self {
            local_id: local_id.into(),
            edges: BTreeMap::new(),
            edge_pipes: HashMap::new(),
        }
    }

    /// Merge a handshake that arrived on `pipe`.
    pub(crate) fn merge(&mut self, pipe: PipeId, handshake: &Handshake) -> Merge {
        if handshake.id == self.local_id {
            return Merge::SelfAnnounce;
        }

        let announced: BTreeSet<String> = handshake
            .channel_ids
            .iter()
            .filter(|id| **id != self.local_id && **id != handshake.id)
            .cloned()
            .collect();

        match self.edges.get_mut(&handshake.id) {
            None => {
                self.edges.insert(
                    handshake.id.clone(),
                    Edge {
                        id: handshake.id.clone(),
                        reachable_ids: announced,
                        discovered_at: Utc::now(),
                    },
                );
                self.edge_pipes.insert(handshake.id.clone(), pipe);
                Merge::Discovered
            }
            Some(edge) => {
                let added: Vec<String> = announced
                    .difference(&edge.reachable_ids)
                    .cloned()
                    .collect();
                if added.is_empty() {
                    Merge::Unchanged
                } else {
                    edge.reachable_ids.extend(added.iter().cloned());
                    Merge::Extended(added)
                }
            }
        }
    }

    /// The directly known peer through which `destination` is reachable.
    ///
    /// A direct edge always wins over a multi-hop route.
    pub(crate) fn find_edge_id(&self, destination: &str) -> Option<String> {
        if self.edges.contains_key(destination) {
            return Some(destination.to_string());
        }
        self.edges
            .values()
            .find(|edge| edge.reachable_ids.contains(destination))
            .map(|edge| edge.id.clone())
    }

    pub(crate) fn pipe_of(&self, edge_id: &str) -> Option<PipeId> {
        self.edge_pipes.get(edge_id).copied()
    }

    /// Ids to announce on `pipe`.
    ///
    /// Ids routed through `pipe` itself are left out so a peer never learns
    /// a route that leads straight back to it.
    pub(crate) fn advertised_ids(&self, pipe: PipeId) -> Vec<String> {
        let mut ids = BTreeSet::new();
        for edge in self.edges.values() {
            if self.pipe_of(&edge.id) == Some(pipe) {
                continue;
            }
            ids.insert(edge.id.clone());
            ids.extend(edge.reachable_ids.iter().cloned());
        }
        ids.remove(&self.local_id);
        ids.into_iter().collect()
    }

    /// Every id this channel can currently route to.
    pub(crate) fn reachable_ids(&self) -> BTreeSet<String> {
        let mut ids = BTreeSet::new();
        for edge in self.edges.values() {
            ids.insert(edge.id.clone());
            ids.extend(edge.reachable_ids.iter().cloned());
        }
        ids
    }

    /// Stop routing `ids` through `pipe`. Returns the ids that became
    /// unreachable, including everything only reachable via a removed peer.
    pub(crate) fn retire(&mut self, pipe: PipeId, ids: &[String]) -> Vec<String> {
        let before = self.reachable_ids();

        for id in ids {
            if self.pipe_of(id) == Some(pipe) {
                self.edges.remove(id);
                self.edge_pipes.remove(id);
            }
        }
        for edge in self.edges.values_mut() {
            if self.edge_pipes.get(&edge.id) == Some(&pipe) {
                edge.reachable_ids.retain(|id| !ids.contains(id));
            }
        }

        let after = self.reachable_ids();
        before.difference(&after).cloned().collect()
    }

    pub(crate) fn edges(&self) -> Vec<Edge> {
        self.edges.values().cloned().collect()
    }

    pub(crate) fn len(&self) -> usize {
        self.edges.len()
    }

    pub(crate) fn clear(&mut self) {
        self.edges.clear();
        self.edge_pipes.clear();
    }
}
