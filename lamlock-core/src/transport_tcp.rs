//! TCP pub/sub transport.
//!
//! Each peer binds one publisher endpoint at `host:(base_port + id)` and
//! connects one subscriber to every other peer's endpoint. A subscriber
//! opens with a single frame naming its topic (its own identity); the
//! publisher then forwards only frames on that topic. Frames are
//! length-delimited, and every data frame is topic-prefixed (see
//! [`frame_with_topic`](crate::codec::frame_with_topic)).
//!
//! Enable with the `tcp` feature flag:
//! ```toml
//! lamlock-core = { path = "../lamlock-core", features = ["tcp"] }
//! ```

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::codec::{Framed, FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, info, warn};

use crate::codec::{frame_with_topic, split_topic};
use crate::error::{ConfigError, TransportError};
use crate::transport::{Inbound, InboundReceiver, InboundSender, Publisher};
use crate::types::{PeerId, PeerSet};

/// Delay between subscriber reconnect attempts
pub const RECONNECT_DELAY: Duration = Duration::from_millis(250);

/// Frames buffered per subscriber connection before publish drops
const SUBSCRIBER_BUFFER: usize = 256;

const MAX_FRAME_LENGTH: usize = 64 * 1024;

fn frame_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LENGTH)
        .new_codec()
}

/// Deterministic endpoint of `peer`
pub fn endpoint_addr(host: IpAddr, base_port: u16, peer: PeerId) -> Result<SocketAddr, ConfigError> {
    let port = u32::from(base_port)
        .checked_add(peer.get())
        .and_then(|p| u16::try_from(p).ok())
        .ok_or(ConfigError::PortOverflow {
            base: base_port,
            id: peer.get(),
        })?;
    Ok(SocketAddr::new(host, port))
}

type SubscriberMap = Arc<Mutex<HashMap<PeerId, Vec<mpsc::Sender<Bytes>>>>>;

/// Bound publisher endpoint
pub struct TcpPublisher {
    local_addr: SocketAddr,
    subscribers: SubscriberMap,
    accept_task: JoinHandle<()>,
}

impl TcpPublisher {
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;
        let subscribers: SubscriberMap = Arc::new(Mutex::new(HashMap::new()));
        let accept_task = tokio::spawn(accept_loop(listener, subscribers.clone()));
        info!(%local_addr, "publisher bound");
        Ok(Self {
            local_addr,
            subscribers,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live subscriptions on `topic`
    pub async fn subscriber_count(&self, topic: PeerId) -> usize {
        let subscribers = self.subscribers.lock().await;
        subscribers
            .get(&topic)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }
}

impl Drop for TcpPublisher {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

#[async_trait]
impl Publisher for TcpPublisher {
    async fn publish(&self, to: PeerId, payload: Bytes) -> Result<(), TransportError> {
        let frame = frame_with_topic(to, &payload);
        let live = {
            let mut subscribers = self.subscribers.lock().await;
            let list = subscribers
                .get_mut(&to)
                .ok_or(TransportError::NoSubscriber(to))?;
            list.retain(|tx| !tx.is_closed());
            list.clone()
        };
        deliver(&live, to, frame)
    }
}

/// Hand `frame` to every subscription of `to` without waiting.
///
/// A subscription whose queue is full misses the frame; the request
/// deadline re-sends whatever mattered.
pub(crate) fn deliver(
    subscriptions: &[mpsc::Sender<Bytes>],
    to: PeerId,
    frame: Bytes,
) -> Result<(), TransportError> {
    let mut delivered = false;
    let mut backlogged = false;
    for tx in subscriptions {
        match tx.try_send(frame.clone()) {
            Ok(()) => delivered = true,
            Err(TrySendError::Full(_)) => {
                warn!(%to, "subscriber queue full, frame dropped");
                backlogged = true;
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }
    match (delivered, backlogged) {
        (true, _) => Ok(()),
        (false, true) => Err(TransportError::Backlogged(to)),
        (false, false) => Err(TransportError::NoSubscriber(to)),
    }
}

async fn accept_loop(listener: TcpListener, subscribers: SubscriberMap) {
    loop {
        match listener.accept().await {
            Ok((stream, remote)) => {
                debug!(%remote, "subscriber connected");
                tokio::spawn(serve_subscriber(stream, remote, subscribers.clone()));
            }
            Err(e) => warn!(error = %e, "accept failed"),
        }
    }
}

async fn serve_subscriber(stream: TcpStream, remote: SocketAddr, subscribers: SubscriberMap) {
    let (read, write) = stream.into_split();
    let mut reader = FramedRead::new(read, frame_codec());
    let mut writer = FramedWrite::new(write, frame_codec());

    let topic = match reader.next().await {
        Some(Ok(frame)) if frame.len() == 4 => {
            PeerId::new(u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]))
        }
        other => {
            warn!(%remote, ?other, "subscriber sent no valid topic");
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel::<Bytes>(SUBSCRIBER_BUFFER);
    subscribers.lock().await.entry(topic).or_default().push(tx);
    info!(%remote, %topic, "subscription registered");

    loop {
        tokio::select! {
            frame = rx.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = writer.send(frame).await {
                        warn!(%remote, %topic, error = %e, "subscriber write failed");
                        break;
                    }
                }
                None => break,
            },
            incoming = reader.next() => match incoming {
                // Subscribers only ever send their topic frame
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(%remote, error = %e, "subscriber read failed");
                    break;
                }
                None => break,
            },
        }
    }
    debug!(%remote, %topic, "subscription closed");
}

/// Subscribes to one remote publisher, reconnecting until the inbound
/// channel is dropped.
pub struct TcpSubscriber;

impl TcpSubscriber {
    pub fn spawn(
        publisher: PeerId,
        addr: SocketAddr,
        topic: PeerId,
        inbound: InboundSender,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                match TcpStream::connect(addr).await {
                    Ok(stream) => {
                        info!(%publisher, %addr, %topic, "subscriber connected");
                        if let Err(e) = pump(stream, publisher, topic, &inbound).await {
                            warn!(%publisher, error = %e, "subscription lost");
                        }
                    }
                    Err(e) => debug!(%publisher, %addr, error = %e, "publisher not reachable yet"),
                }
                if inbound.is_closed() {
                    return;
                }
                tokio::time::sleep(RECONNECT_DELAY).await;
            }
        })
    }
}

async fn pump(
    stream: TcpStream,
    publisher: PeerId,
    topic: PeerId,
    inbound: &InboundSender,
) -> Result<(), TransportError> {
    let mut framed = Framed::new(stream, frame_codec());
    framed
        .send(Bytes::copy_from_slice(&topic.get().to_be_bytes()))
        .await?;

    while let Some(frame) = framed.next().await {
        let (frame_topic, payload) = match split_topic(frame?.freeze()) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(%publisher, error = %e, "dropping frame");
                continue;
            }
        };
        if frame_topic != topic {
            continue;
        }
        if inbound
            .send(Inbound {
                from: publisher,
                payload,
            })
            .is_err()
        {
            return Ok(());
        }
    }
    Ok(())
}

/// A peer's complete TCP transport: its publisher plus one subscriber per
/// other peer, all feeding a single inbound channel.
pub struct TcpTransport {
    pub publisher: TcpPublisher,
    pub inbound: InboundReceiver,
    pub subscriptions: Vec<JoinHandle<()>>,
}

impl TcpTransport {
    pub async fn start(
        me: PeerId,
        peers: PeerSet,
        host: IpAddr,
        base_port: u16,
    ) -> Result<Self, TransportError> {
        let addr = endpoint_addr(host, base_port, me)?;
        let publisher = TcpPublisher::bind(addr).await?;

        let (tx, inbound) = mpsc::unbounded_channel();
        let mut subscriptions = Vec::new();
        for peer in peers.others(me) {
            let remote = endpoint_addr(host, base_port, peer)?;
            subscriptions.push(TcpSubscriber::spawn(peer, remote, me, tx.clone()));
        }

        Ok(Self {
            publisher,
            inbound,
            subscriptions,
        })
    }
}
