//! # lamlock-core
//!
//! Distributed mutual exclusion for a fixed group of peers.
//! Implements the Ricart–Agrawala permission protocol ordered by Lamport
//! clocks, a replicated integer resource kept in sync by UPDATE
//! broadcasts, a JSON wire codec and pub/sub transports (in-memory, and
//! TCP behind the `tcp` feature).

pub mod chooser;
pub mod clock;
pub mod cluster;
pub mod codec;
pub mod engine;
pub mod error;
pub mod node;
pub mod permission;
pub mod propagator;
pub mod queue;
pub mod resource;
pub mod transport;
#[path = "transport_in_memory.rs"]
pub mod transport_in_memory;
#[cfg(feature = "tcp")]
#[path = "transport_tcp.rs"]
pub mod transport_tcp;
pub mod types;

#[cfg(test)]
mod codec_test;
#[cfg(test)]
mod engine_test;
