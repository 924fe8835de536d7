use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::transport::{Inbound, InboundReceiver, InboundSender, Publisher};
use crate::types::{PeerId, PeerSet};

/// In-process pub/sub network for tests and simulations.
///
/// Every peer gets one inbox. A peer can be cut off and reconnected;
/// frames published to or from a disconnected peer are lost.
pub struct InMemoryNetwork {
    inboxes: HashMap<PeerId, InboundSender>,
    receivers: HashMap<PeerId, InboundReceiver>,
    online: Arc<HashMap<PeerId, AtomicBool>>,
}

impl InMemoryNetwork {
    pub fn new(peers: PeerSet) -> Self {
        let mut inboxes = HashMap::new();
        let mut receivers = HashMap::new();
        let mut online = HashMap::new();
        for peer in peers.iter() {
            let (tx, rx) = mpsc::unbounded_channel();
            inboxes.insert(peer, tx);
            receivers.insert(peer, rx);
            online.insert(peer, AtomicBool::new(true));
        }
        Self {
            inboxes,
            receivers,
            online: Arc::new(online),
        }
    }

    /// Take the endpoint of `peer`. Each endpoint can be taken once.
    pub fn endpoint(
        &mut self,
        peer: PeerId,
    ) -> Option<(InMemoryPublisher, InboundReceiver)> {
        let rx = self.receivers.remove(&peer)?;
        let publisher = InMemoryPublisher {
            me: peer,
            inboxes: self.inboxes.clone(),
            online: self.online.clone(),
        };
        Some((publisher, rx))
    }

    pub fn disconnect(&self, peer: PeerId) {
        if let Some(flag) = self.online.get(&peer) {
            flag.store(false, Ordering::SeqCst);
        }
    }

    pub fn reconnect(&self, peer: PeerId) {
        if let Some(flag) = self.online.get(&peer) {
            flag.store(true, Ordering::SeqCst);
        }
    }

    pub fn is_online(&self, peer: PeerId) -> bool {
        self.online
            .get(&peer)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

pub struct InMemoryPublisher {
    me: PeerId,
    inboxes: HashMap<PeerId, InboundSender>,
    online: Arc<HashMap<PeerId, AtomicBool>>,
}

impl InMemoryPublisher {
    fn online(&self, peer: PeerId) -> bool {
        self.online
            .get(&peer)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }
}

#[async_trait]
impl Publisher for InMemoryPublisher {
    async fn publish(&self, to: PeerId, payload: Bytes) -> Result<(), TransportError> {
        if !self.online(self.me) || !self.online(to) {
            return Err(TransportError::Unreachable(to));
        }
        let inbox = self
            .inboxes
            .get(&to)
            .ok_or(TransportError::NoSubscriber(to))?;
        inbox
            .send(Inbound {
                from: self.me,
                payload,
            })
            .map_err(|_| TransportError::Closed)
    }
}
