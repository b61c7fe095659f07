//! The ordered set of peers the local user can converse with.

use std::collections::HashSet;

use crate::api::AddPeerResponse;
use crate::types::{Peer, PeerId};

/// What a roster mutation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RosterChange {
    /// The whole roster was swapped for a server snapshot.
    Replaced,
    /// One peer was appended.
    Appended(PeerId),
    Removed(PeerId),
    Unchanged,
    /// The server answer could not be interpreted; fetch the full roster.
    NeedsRefetch,
}

/// Result of adding a peer, as reported to callers of the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddPeerOutcome {
    Added,
    AlreadyPresent,
    /// The response was unrecognized and the roster was refetched instead.
    Refetched,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Roster {
    peers: Vec<Peer>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn contains(&self, id: &PeerId) -> bool {
        self.peers.iter().any(|peer| &peer.id == id)
    }

    /// Replace the roster with a server snapshot, keeping server order.
    /// Repeated ids keep their first occurrence.
    pub fn replace(&mut self, peers: Vec<Peer>) -> RosterChange {
        let mut seen = HashSet::with_capacity(peers.len());
        self.peers = peers
            .into_iter()
            .filter(|peer| seen.insert(peer.id.clone()))
            .collect();
        RosterChange::Replaced
    }

    /// Update the online flag of a roster member. Returns `false` for strangers.
    pub fn set_presence(&mut self, id: &PeerId, online: bool) -> bool {
        match self.peers.iter_mut().find(|peer| &peer.id == id) {
            Some(peer) => {
                peer.online = Some(online);
                true
            }
            None => false,
        }
    }

    pub fn apply_add(&mut self, response: AddPeerResponse) -> RosterChange {
        match response {
            AddPeerResponse::Roster(peers) => self.replace(peers),
            AddPeerResponse::Added(peer) if self.contains(&peer.id) => RosterChange::Unchanged,
            AddPeerResponse::Added(peer) => {
                let id = peer.id.clone();
                self.peers.push(peer);
                RosterChange::Appended(id)
            }
            AddPeerResponse::Unrecognized => RosterChange::NeedsRefetch,
        }
    }

    pub fn remove(&mut self, id: &PeerId) -> RosterChange {
        let before = self.peers.len();
        self.peers.retain(|peer| &peer.id != id);
        if self.peers.len() == before {
            RosterChange::Unchanged
        } else {
            RosterChange::Removed(id.clone())
        }
    }

    /// Search results that can still be added: not already in the roster and
    /// not the local user.
    pub fn available_candidates(&self, candidates: Vec<Peer>, local_user: &PeerId) -> Vec<Peer> {
        candidates
            .into_iter()
            .filter(|peer| &peer.id != local_user && !self.contains(&peer.id))
            .collect()
    }
}
