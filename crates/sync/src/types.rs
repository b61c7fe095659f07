//! Domain types shared by the roster, conversation store, and orchestrator.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Opaque identity of a chat participant. Equality is exact string match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for PeerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl PartialEq<str> for PeerId {
    fn eq(&self, other: &str) -> bool {
        self.0 == other
    }
}

impl PartialEq<&str> for PeerId {
    fn eq(&self, other: &&str) -> bool {
        self.0 == *other
    }
}

/// A chat participant as returned by the roster and search endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    #[serde(rename = "_id", alias = "id")]
    pub id: PeerId,
    #[serde(rename = "name", alias = "displayName", default)]
    pub display_name: String,
    #[serde(default)]
    pub email: String,
    #[serde(rename = "pinnedAt", default, skip_serializing_if = "Option::is_none")]
    pub pinned_at: Option<DateTime<Utc>>,
    #[serde(rename = "addedAt", default, skip_serializing_if = "Option::is_none")]
    pub added_at: Option<DateTime<Utc>>,
    #[serde(
        rename = "isOnline",
        alias = "online",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub online: Option<bool>,
}

impl Peer {
    pub fn new(id: impl Into<PeerId>, display_name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            email: email.into(),
            pinned_at: None,
            added_at: None,
            online: None,
        }
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned_at.is_some()
    }
}

/// Which side of the conversation authored a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Direction {
    Local,
    Remote,
}

impl Direction {
    pub fn from_sender(sender: &PeerId, local_user: &PeerId) -> Self {
        if sender == local_user {
            Direction::Local
        } else {
            Direction::Remote
        }
    }
}

/// A single chat message. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: PeerId,
    pub receiver: PeerId,
    pub direction: Direction,
    pub text: String,
    pub sent_at: DateTime<Utc>,
    pub read: bool,
}

/// Fields that identify the same logical message across history and pushes.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    sender: PeerId,
    receiver: PeerId,
    sent_at: DateTime<Utc>,
    text: String,
}

impl Message {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            sender: self.sender.clone(),
            receiver: self.receiver.clone(),
            sent_at: self.sent_at,
            text: self.text.clone(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.direction == Direction::Local
    }
}

/// Current local user and selected peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionContext {
    pub local_user: PeerId,
    pub selected_peer: Option<PeerId>,
}

impl SessionContext {
    pub fn new(local_user: PeerId) -> Self {
        Self {
            local_user,
            selected_peer: None,
        }
    }

    pub fn is_selected(&self, peer: &PeerId) -> bool {
        self.selected_peer.as_ref() == Some(peer)
    }
}
