use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

use crate::error::TransportError;
use crate::types::PeerId;

/// A frame received on one of our subscriptions
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The publisher whose endpoint delivered the frame
    pub from: PeerId,
    pub payload: Bytes,
}

/// Single-consumer channel every subscription posts into
pub type InboundSender = mpsc::UnboundedSender<Inbound>;
pub type InboundReceiver = mpsc::UnboundedReceiver<Inbound>;

/// Outbound half of the pub/sub transport.
///
/// Inbound frames from every subscription are funnelled into one
/// [`InboundReceiver`] handed to the node alongside the publisher.
#[async_trait]
pub trait Publisher: Send + Sync {
    /// Publish an encoded message on the topic `to`.
    /// Only the subscriber with that identity receives it.
    async fn publish(&self, to: PeerId, payload: Bytes) -> Result<(), TransportError>;
}
