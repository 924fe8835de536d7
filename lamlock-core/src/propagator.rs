use tracing::debug;

use crate::types::{Envelope, Message, Mutation, PeerId, PeerSet};

/// Fans a local write out to every other replica.
///
/// Best-effort and unordered; replicas converge because each UPDATE is
/// versioned by the writer's request stamp.
#[derive(Debug, Clone, Copy)]
pub struct UpdatePropagator {
    me: PeerId,
    peers: PeerSet,
}

impl UpdatePropagator {
    pub fn new(me: PeerId, peers: PeerSet) -> Self {
        Self { me, peers }
    }

    pub fn propagate(&self, mutation: Mutation) -> Vec<Envelope> {
        let outbound: Vec<Envelope> = self
            .peers
            .others(self.me)
            .map(|peer| Envelope::new(peer, Message::update(self.me, mutation)))
            .collect();
        debug!(
            peer = %self.me,
            position = mutation.position,
            value = mutation.value,
            fanout = outbound.len(),
            "propagating update"
        );
        outbound
    }
}
