use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::types::{LogicalTime, PeerId, RequestStamp};

/// A grant we owe but have postponed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredEntry {
    pub peer: PeerId,
    /// Clock of the deferred request, echoed back in the eventual ACK
    pub clock: LogicalTime,
}

impl DeferredEntry {
    pub fn stamp(&self) -> RequestStamp {
        RequestStamp::new(self.clock, self.peer)
    }
}

/// Deferred requests in arrival order.
///
/// Never re-sorted. A peer appears at most once: a newer request from a
/// peer that is already queued overwrites the clock of its existing entry
/// and keeps its position.
#[derive(Debug, Clone, Default)]
pub struct DeferredQueue {
    entries: VecDeque<DeferredEntry>,
}

impl DeferredQueue {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
        }
    }

    /// Queue a grant for `peer`. Returns false when the peer was already
    /// queued and only its clock was refreshed.
    pub fn defer(&mut self, peer: PeerId, clock: LogicalTime) -> bool {
        if let Some(existing) = self.entries.iter_mut().find(|e| e.peer == peer) {
            existing.clock = existing.clock.max(clock);
            return false;
        }
        self.entries.push_back(DeferredEntry { peer, clock });
        true
    }

    pub fn remove(&mut self, peer: PeerId) -> Option<DeferredEntry> {
        let index = self.entries.iter().position(|e| e.peer == peer)?;
        self.entries.remove(index)
    }

    /// Take every entry, FIFO. The queue is empty afterwards.
    pub fn drain(&mut self) -> impl Iterator<Item = DeferredEntry> + '_ {
        self.entries.drain(..)
    }

    /// Take the entries whose request now orders before `own`, keeping the
    /// rest in their original order.
    pub fn take_preceding(&mut self, own: RequestStamp) -> Vec<DeferredEntry> {
        let mut taken = Vec::new();
        self.entries.retain(|entry| {
            if entry.stamp().precedes(&own) {
                taken.push(*entry);
                false
            } else {
                true
            }
        });
        taken
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        self.entries.iter().any(|e| e.peer == peer)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DeferredEntry> {
        self.entries.iter()
    }
}
