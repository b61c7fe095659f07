//! Remote typing indicators with time-based expiry.
//!
//! A peer is "typing" from the moment a signal arrives until `ttl` after the
//! most recent signal. Each active peer owns one timer task; a new signal
//! aborts that task and schedules a fresh one. The timer does not touch the
//! tracker itself: it posts a [`TypingExpiry`] back to the owner, which calls
//! [`TypingTracker::expire`] on its own event loop.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

use crate::types::PeerId;

pub const DEFAULT_TYPING_TTL: Duration = Duration::from_millis(3000);

/// Posted when a peer's typing timer elapses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypingExpiry {
    pub peer: PeerId,
    pub generation: u64,
}

#[derive(Debug)]
struct Entry {
    generation: u64,
    timer: JoinHandle<()>,
}

#[derive(Debug)]
pub struct TypingTracker {
    ttl: Duration,
    entries: HashMap<PeerId, Entry>,
    next_generation: u64,
    expiries: mpsc::UnboundedSender<TypingExpiry>,
}

impl TypingTracker {
    pub fn new(ttl: Duration, expiries: mpsc::UnboundedSender<TypingExpiry>) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
            next_generation: 0,
            expiries,
        }
    }

    /// Record a typing signal from `peer`. Returns `true` when the peer was idle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn signal(&mut self, peer: &PeerId) -> bool {
        let previous = self.entries.remove(peer);
        if let Some(entry) = &previous {
            entry.timer.abort();
        }

        self.next_generation += 1;
        let generation = self.next_generation;
        let expires_at = Instant::now() + self.ttl;

        let expiries = self.expiries.clone();
        let expiry = TypingExpiry {
            peer: peer.clone(),
            generation,
        };
        let timer = tokio::spawn(async move {
            sleep_until(expires_at).await;
            let _ = expiries.send(expiry);
        });

        trace!(peer = %peer, generation, "typing timer scheduled");
        self.entries.insert(
            peer.clone(),
            Entry {
                generation,
                timer,
            },
        );
        previous.is_none()
    }

    /// Apply an elapsed timer. Stale expiries (superseded by a later signal)
    /// are ignored. Returns `true` when the peer went idle.
    pub fn expire(&mut self, expiry: &TypingExpiry) -> bool {
        match self.entries.get(&expiry.peer) {
            Some(entry) if entry.generation == expiry.generation => {
                self.entries.remove(&expiry.peer);
                true
            }
            _ => false,
        }
    }

    pub fn is_typing(&self, peer: &PeerId) -> bool {
        self.entries.contains_key(peer)
    }

    pub fn active_peers(&self) -> impl Iterator<Item = &PeerId> {
        self.entries.keys()
    }

    /// Drop the peer's indicator and cancel its timer.
    pub fn forget(&mut self, peer: &PeerId) -> bool {
        match self.entries.remove(peer) {
            Some(entry) => {
                entry.timer.abort();
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        for (_, entry) in self.entries.drain() {
            entry.timer.abort();
        }
    }
}

impl Drop for TypingTracker {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::advance;

    fn tracker() -> (TypingTracker, mpsc::UnboundedReceiver<TypingExpiry>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TypingTracker::new(DEFAULT_TYPING_TTL, tx), rx)
    }

    async fn settle() {
        for _ in 0..4 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn expires_after_ttl() {
        let (mut tracker, mut expiries) = tracker();
        let peer = PeerId::from("u2");

        assert!(tracker.signal(&peer));
        assert!(tracker.is_typing(&peer));

        advance(Duration::from_millis(2999)).await;
        settle().await;
        assert!(expiries.try_recv().is_err());

        advance(Duration::from_millis(1)).await;
        let expiry = expiries.recv().await.unwrap();
        assert!(tracker.expire(&expiry));
        assert!(!tracker.is_typing(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_signal_resets_the_timer() {
        let (mut tracker, mut expiries) = tracker();
        let peer = PeerId::from("u2");

        tracker.signal(&peer);
        advance(Duration::from_millis(2000)).await;
        assert!(!tracker.signal(&peer));

        // 3000 ms after the first signal the indicator must still be active.
        advance(Duration::from_millis(1000)).await;
        settle().await;
        assert!(expiries.try_recv().is_err());
        assert!(tracker.is_typing(&peer));

        advance(Duration::from_millis(2000)).await;
        let expiry = expiries.recv().await.unwrap();
        assert!(tracker.expire(&expiry));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_expiry_is_ignored() {
        let (mut tracker, _expiries) = tracker();
        let peer = PeerId::from("u2");

        tracker.signal(&peer);
        let stale = TypingExpiry {
            peer: peer.clone(),
            generation: 1,
        };
        tracker.signal(&peer);

        assert!(!tracker.expire(&stale));
        assert!(tracker.is_typing(&peer));
    }

    #[tokio::test(start_paused = true)]
    async fn forget_cancels_the_timer() {
        let (mut tracker, mut expiries) = tracker();
        let peer = PeerId::from("u2");

        tracker.signal(&peer);
        assert!(tracker.forget(&peer));
        assert!(!tracker.is_typing(&peer));

        advance(Duration::from_millis(5000)).await;
        settle().await;
        assert!(expiries.try_recv().is_err());
    }
}
