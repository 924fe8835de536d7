use tracing::trace;

use crate::types::LogicalTime;

/// Lamport logical clock for one peer.
///
/// Advances by one on every outgoing REQUEST and jumps past the sender's
/// value on every inbound REQUEST. ACK and UPDATE leave it untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LamportClock {
    time: LogicalTime,
}

impl LamportClock {
    pub fn new() -> Self {
        Self { time: 0 }
    }

    /// Send event: increment and return the new value
    pub fn tick(&mut self) -> LogicalTime {
        self.time = self.time.saturating_add(1);
        trace!(clock = self.time, "clock tick");
        self.time
    }

    /// Receive event: `max(local, received) + 1`
    pub fn observe(&mut self, received: LogicalTime) -> LogicalTime {
        self.time = self.time.max(received).saturating_add(1);
        trace!(clock = self.time, received, "clock observe");
        self.time
    }

    pub fn current(&self) -> LogicalTime {
        self.time
    }
}
