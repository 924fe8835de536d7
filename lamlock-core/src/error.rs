//! Error types for the lamlock kernel.
//!
//! Every error here is recoverable at the engine boundary: the node driver
//! logs it and keeps serving its subscriptions.

use std::net::SocketAddr;

use thiserror::Error;

use crate::types::PeerId;

/// Bad access to the shared resource replica
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResourceError {
    #[error("position {position} is out of range for capacity {capacity}")]
    OutOfRange { position: usize, capacity: usize },

    #[error("replace expected {expected} values, got {actual}")]
    CapacityMismatch { expected: usize, actual: usize },
}

/// A call that does not fit the current critical-section state.
/// Returned before any state is touched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    #[error("a request is already outstanding")]
    AlreadyRequesting,

    #[error("the critical section is already held")]
    AlreadyInCriticalSection,

    #[error("the critical section is not held")]
    NotInCriticalSection,

    #[error("no request is outstanding")]
    NotRequesting,

    #[error("only {received} of {needed} grants received")]
    GrantsOutstanding { received: usize, needed: usize },

    #[error("slot {position} already holds a newer write")]
    WriteSuperseded { position: usize },

    #[error(transparent)]
    Resource(#[from] ResourceError),
}

/// A wire packet that could not be encoded or decoded
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed packet: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid sender identity {0}")]
    InvalidIdentity(u32),

    #[error("{kind} packet is missing `{field}`")]
    MissingField {
        kind: &'static str,
        field: &'static str,
    },

    #[error("value `{0}` is not an integer")]
    InvalidValue(String),

    #[error("position {0} is negative")]
    InvalidPosition(i64),

    #[error("frame too short to carry a topic ({0} bytes)")]
    ShortFrame(usize),
}

/// Failure in the pub/sub transport
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to bind publisher on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("no subscriber for topic {0}")]
    NoSubscriber(PeerId),

    #[error("subscriber queue for topic {0} is full")]
    Backlogged(PeerId),

    #[error("peer {0} is unreachable")]
    Unreachable(PeerId),

    #[error("transport closed")]
    Closed,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Invalid startup configuration
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("the group needs at least one peer")]
    NoPeers,

    #[error("peer identity {id} is outside [1, {peers}]")]
    InvalidIdentity { id: u32, peers: u32 },

    #[error("resource capacity must be at least 1")]
    ZeroCapacity,

    #[error("port {base} + {id} does not fit in a u16")]
    PortOverflow { base: u16, id: u32 },
}

/// Failure talking to a running node
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NodeError {
    #[error("node has stopped")]
    Stopped,

    #[error(transparent)]
    Engine(#[from] EngineError),
}

/// A property broken while driving an in-process cluster
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SimulationError {
    #[error("peer {entering} entered the critical section while {holder} held it")]
    MutualExclusion { holder: PeerId, entering: PeerId },

    #[error("no progress possible with {waiting} peer(s) still requesting")]
    Stalled { waiting: usize },

    #[error("gave up after {0} steps")]
    StepLimit(usize),

    #[error(transparent)]
    Engine(#[from] EngineError),
}
