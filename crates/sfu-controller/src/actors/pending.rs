//! Pending-consumption queue.
//!
//! Peers announced to a session before its receive transport is connected
//! are remembered here in arrival order. When the receive transport reaches
//! `Connected` the queue is flushed exactly once; afterwards announcements
//! are consumed directly and the queue stays empty.

use std::collections::{HashSet, VecDeque};

/// Per-session queue of peer IDs awaiting consumption.
#[derive(Debug, Default)]
pub struct PendingConsumption {
    queue: VecDeque<String>,
    consumed: HashSet<String>,
    flushed: bool,
    discarded: bool,
}

impl PendingConsumption {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a peer. Returns `false` if the peer is already pending, already
    /// consumed, or the queue has been flushed or discarded.
    pub fn enqueue(&mut self, peer_id: &str) -> bool {
        if self.flushed
            || self.discarded
            || self.consumed.contains(peer_id)
            || self.queue.iter().any(|queued| queued == peer_id)
        {
            return false;
        }
        self.queue.push_back(peer_id.to_string());
        true
    }

    /// Drop a peer from the queue (the peer left before being consumed).
    pub fn remove(&mut self, peer_id: &str) -> bool {
        let before = self.queue.len();
        self.queue.retain(|queued| queued != peer_id);
        before != self.queue.len()
    }

    /// Remember that a peer has been consumed from.
    pub fn mark_consumed(&mut self, peer_id: &str) {
        self.consumed.insert(peer_id.to_string());
    }

    /// Forget everything about a peer that left the room.
    pub fn forget(&mut self, peer_id: &str) {
        self.remove(peer_id);
        self.consumed.remove(peer_id);
    }

    /// Take the queued peers in arrival order.
    ///
    /// Returns `Some` exactly once; every later call returns `None`.
    pub fn flush(&mut self) -> Option<Vec<String>> {
        if self.flushed || self.discarded {
            return None;
        }
        self.flushed = true;
        Some(self.queue.drain(..).collect())
    }

    /// Drop all queued entries without processing them (session closing).
    pub fn discard(&mut self) -> usize {
        self.discarded = true;
        let dropped = self.queue.len();
        self.queue.clear();
        dropped
    }

    #[must_use]
    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queued peer IDs in arrival order.
    #[must_use]
    pub fn peers(&self) -> Vec<String> {
        self.queue.iter().cloned().collect()
    }
}
