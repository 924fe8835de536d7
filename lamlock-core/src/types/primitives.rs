use serde::{Deserialize, Serialize};

/// A Lamport timestamp value.
pub type LogicalTime = u64;

/// Identity of a peer in the group, in `[1, N]`.
/// Doubles as the pub/sub topic and as the tie-break key between requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u32);

impl PeerId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for PeerId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

/// The `(clock, peer)` pair a request is ordered by.
///
/// Field order matters: the derived `Ord` compares the clock first and
/// falls back to the peer identity, so the lower peer wins a tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RequestStamp {
    pub clock: LogicalTime,
    pub peer: PeerId,
}

impl RequestStamp {
    pub const fn new(clock: LogicalTime, peer: PeerId) -> Self {
        Self { clock, peer }
    }

    /// True when this request must be served before `other`.
    pub fn precedes(&self, other: &RequestStamp) -> bool {
        self < other
    }
}

/// What a peer does with the resource once it holds it.
/// Configured per peer at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    /// Only reads the replica inside the critical section
    ReadOnly,
    /// Writes a new value and broadcasts it on release
    ReadWrite,
}

impl Role {
    pub fn access(self) -> Access {
        match self {
            Role::ReadOnly => Access::Read,
            Role::ReadWrite => Access::Write,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::ReadOnly => write!(f, "read-only"),
            Role::ReadWrite => write!(f, "read-write"),
        }
    }
}

/// The action performed inside one critical section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Access {
    Read,
    Write,
}

/// The fixed membership `[1, N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerSet {
    size: u32,
}

impl PeerSet {
    pub const fn new(size: u32) -> Self {
        Self { size }
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    pub fn contains(&self, peer: PeerId) -> bool {
        (1..=self.size).contains(&peer.get())
    }

    pub fn iter(&self) -> impl Iterator<Item = PeerId> + use<> {
        (1..=self.size).map(PeerId::new)
    }

    /// Every member except `me`, in ascending order.
    pub fn others(&self, me: PeerId) -> impl Iterator<Item = PeerId> + use<> {
        self.iter().filter(move |p| *p != me)
    }

    /// How many grants a member needs before entering the critical section.
    pub fn quorum(&self) -> usize {
        self.size.saturating_sub(1) as usize
    }
}
