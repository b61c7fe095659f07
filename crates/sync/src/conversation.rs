//! Per-peer message threads.
//!
//! Each thread is ordered by `sent_at` with insertion order breaking ties.
//! History snapshots are stable-sorted by `sent_at` but otherwise kept as sent,
//! duplicates included; single appends are de-duplicated by [`DedupKey`].

use std::collections::{HashMap, HashSet};

use crate::types::{DedupKey, Message, PeerId};

#[derive(Debug, Clone, Default)]
struct Thread {
    messages: Vec<Message>,
    keys: HashSet<DedupKey>,
}

impl Thread {
    fn from_snapshot(mut messages: Vec<Message>) -> Self {
        // stable: equal timestamps keep server order
        messages.sort_by_key(|message| message.sent_at);
        let keys = messages.iter().map(Message::dedup_key).collect();
        Self { messages, keys }
    }

    fn insert(&mut self, message: Message) -> bool {
        if !self.keys.insert(message.dedup_key()) {
            return false;
        }
        let index = self
            .messages
            .partition_point(|existing| existing.sent_at <= message.sent_at);
        self.messages.insert(index, message);
        true
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConversationStore {
    threads: HashMap<PeerId, Thread>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the thread for `peer` with an authoritative snapshot.
    pub fn replace(&mut self, peer: &PeerId, messages: Vec<Message>) {
        self.threads
            .insert(peer.clone(), Thread::from_snapshot(messages));
    }

    /// Insert one message in order. Returns `false` when an identical message
    /// is already present.
    pub fn append(&mut self, peer: &PeerId, message: Message) -> bool {
        self.threads.entry(peer.clone()).or_default().insert(message)
    }

    pub fn messages(&self, peer: &PeerId) -> &[Message] {
        self.threads
            .get(peer)
            .map(|thread| thread.messages.as_slice())
            .unwrap_or_default()
    }

    pub fn has_thread(&self, peer: &PeerId) -> bool {
        self.threads.contains_key(peer)
    }

    /// Case-insensitive substring filter over the thread. An empty needle
    /// returns every message.
    pub fn search(&self, peer: &PeerId, needle: &str) -> Vec<Message> {
        let needle = needle.to_lowercase();
        self.messages(peer)
            .iter()
            .filter(|message| needle.is_empty() || message.text.to_lowercase().contains(&needle))
            .cloned()
            .collect()
    }

    /// Empty the thread but keep it present.
    pub fn clear(&mut self, peer: &PeerId) {
        self.threads.insert(peer.clone(), Thread::default());
    }

    pub fn remove(&mut self, peer: &PeerId) -> bool {
        self.threads.remove(peer).is_some()
    }
}
