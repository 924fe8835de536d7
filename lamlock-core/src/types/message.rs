use serde::{Deserialize, Serialize};

use super::{LogicalTime, PeerId, RequestStamp};

/// The three protocol messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageKind {
    /// Ask every other peer for permission, as of `clock`
    Request { clock: LogicalTime },
    /// Grant the request that was stamped with `clock`
    Ack { clock: LogicalTime },
    /// A write made inside the sender's critical section.
    /// `clock` is the writer's request clock and versions the slot.
    Update {
        position: usize,
        value: i64,
        clock: LogicalTime,
    },
}

/// A protocol message, always tagged with its sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub sender: PeerId,
    pub kind: MessageKind,
}

impl Message {
    pub fn request(sender: PeerId, clock: LogicalTime) -> Self {
        Self {
            sender,
            kind: MessageKind::Request { clock },
        }
    }

    pub fn ack(sender: PeerId, clock: LogicalTime) -> Self {
        Self {
            sender,
            kind: MessageKind::Ack { clock },
        }
    }

    pub fn update(sender: PeerId, mutation: Mutation) -> Self {
        Self {
            sender,
            kind: MessageKind::Update {
                position: mutation.position,
                value: mutation.value,
                clock: mutation.stamp.clock,
            },
        }
    }

    pub fn label(&self) -> &'static str {
        match self.kind {
            MessageKind::Request { .. } => "REQUEST",
            MessageKind::Ack { .. } => "ACK",
            MessageKind::Update { .. } => "UPDATE",
        }
    }
}

/// An outbound message and the peer it is addressed to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Envelope {
    pub to: PeerId,
    pub message: Message,
}

impl Envelope {
    pub fn new(to: PeerId, message: Message) -> Self {
        Self { to, message }
    }
}

/// A write to the shared resource, versioned by the writer's request stamp
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mutation {
    pub position: usize,
    pub value: i64,
    pub stamp: RequestStamp,
}

/// What happened inside a critical section
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AccessOutcome {
    Read { position: usize, value: i64 },
    Write(Mutation),
}

impl AccessOutcome {
    pub fn mutation(&self) -> Option<Mutation> {
        match self {
            AccessOutcome::Read { .. } => None,
            AccessOutcome::Write(mutation) => Some(*mutation),
        }
    }
}
