//! The mutual-exclusion state machine.
//!
//! `MutexEngine` owns one peer's Lamport clock, request flags, grant set,
//! deferred queue and resource replica. It performs no I/O: every
//! operation returns a [`Step`] listing the envelopes to send, and the
//! caller (the node driver, a simulation, a test) delivers them.
//!
//! Phases: `Idle -> Requesting -> InCriticalSection -> Idle`. Requests
//! from other peers are handled in every phase; while the critical
//! section is held they are always queued.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::chooser::{AccessChooser, RandomChooser};
use crate::clock::LamportClock;
use crate::error::{ConfigError, EngineError};
use crate::permission::{PermissionRule, Verdict};
use crate::propagator::UpdatePropagator;
use crate::queue::{DeferredEntry, DeferredQueue};
use crate::resource::{DEFAULT_CAPACITY, SharedResource};
use crate::types::{
    Access, AccessOutcome, Envelope, LogicalTime, Message, MessageKind, Mutation, PeerId, PeerSet,
    RequestStamp, Role,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Phase {
    Idle,
    Requesting,
    InCriticalSection,
}

/// Static settings of one peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineConfig {
    pub me: PeerId,
    pub peers: PeerSet,
    pub role: Role,
    pub capacity: usize,
}

impl Default for EngineConfig {
    /// Peer 1 of the three-peer reference group, read-only
    fn default() -> Self {
        Self {
            me: PeerId::new(1),
            peers: PeerSet::new(3),
            role: Role::ReadOnly,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl EngineConfig {
    pub fn new(me: u32, peers: u32, role: Role) -> Result<Self, ConfigError> {
        let config = Self {
            me: PeerId::new(me),
            peers: PeerSet::new(peers),
            role,
            capacity: DEFAULT_CAPACITY,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn with_capacity(mut self, capacity: usize) -> Result<Self, ConfigError> {
        self.capacity = capacity;
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.peers.size() == 0 {
            return Err(ConfigError::NoPeers);
        }
        if !self.peers.contains(self.me) {
            return Err(ConfigError::InvalidIdentity {
                id: self.me.get(),
                peers: self.peers.size(),
            });
        }
        if self.capacity == 0 {
            return Err(ConfigError::ZeroCapacity);
        }
        Ok(())
    }
}

/// What the caller must do after an engine operation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Step {
    /// Messages to send, in order
    pub outbound: Vec<Envelope>,
    /// Set when this operation moved the peer into the critical section
    pub entered: Option<AccessOutcome>,
    /// Set when an inbound UPDATE changed the local replica
    pub applied: Option<Mutation>,
}

impl Step {
    fn send(outbound: Vec<Envelope>) -> Self {
        Self {
            outbound,
            ..Self::default()
        }
    }
}

/// Point-in-time view of a peer, for logs and tests
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub peer: PeerId,
    pub role: Role,
    pub clock: LogicalTime,
    pub phase: Phase,
    pub request: Option<RequestStamp>,
    pub grants: Vec<PeerId>,
    pub deferred: Vec<DeferredEntry>,
    pub resource: Vec<i64>,
}

pub struct MutexEngine {
    config: EngineConfig,
    clock: LamportClock,
    phase: Phase,
    /// Our outstanding request; kept while the critical section is held
    request: Option<RequestStamp>,
    grants: BTreeSet<PeerId>,
    deferred: DeferredQueue,
    resource: SharedResource,
    propagator: UpdatePropagator,
    chooser: Box<dyn AccessChooser>,
}

impl MutexEngine {
    /// An idle peer with a replica of `config.capacity` slots and a
    /// chooser seeded from the peer identity.
    pub fn new(config: EngineConfig) -> Self {
        let chooser = RandomChooser::seeded(u64::from(config.me.get()));
        Self::with_chooser(config, Box::new(chooser))
    }

    pub fn with_chooser(config: EngineConfig, chooser: Box<dyn AccessChooser>) -> Self {
        Self {
            config,
            clock: LamportClock::new(),
            phase: Phase::Idle,
            request: None,
            grants: BTreeSet::new(),
            deferred: DeferredQueue::new(),
            resource: SharedResource::new(config.capacity),
            propagator: UpdatePropagator::new(config.me, config.peers),
            chooser,
        }
    }

    pub fn me(&self) -> PeerId {
        self.config.me
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn clock(&self) -> LogicalTime {
        self.clock.current()
    }

    /// True while a request is outstanding or the section is held
    pub fn is_requesting(&self) -> bool {
        self.phase != Phase::Idle
    }

    pub fn is_using_resource(&self) -> bool {
        self.phase == Phase::InCriticalSection
    }

    pub fn request_stamp(&self) -> Option<RequestStamp> {
        self.request
    }

    pub fn ack_count(&self) -> usize {
        self.grants.len()
    }

    pub fn deferred(&self) -> &DeferredQueue {
        &self.deferred
    }

    pub fn resource(&self) -> &SharedResource {
        &self.resource
    }

    pub fn resource_mut(&mut self) -> &mut SharedResource {
        &mut self.resource
    }

    pub fn status(&self) -> PeerStatus {
        PeerStatus {
            peer: self.config.me,
            role: self.config.role,
            clock: self.clock.current(),
            phase: self.phase,
            request: self.request,
            grants: self.grants.iter().copied().collect(),
            deferred: self.deferred.iter().copied().collect(),
            resource: self.resource.snapshot(),
        }
    }

    // ─── Local operations ──────────────────────────────────────────────

    /// Ask every other peer for the resource.
    ///
    /// In a group of one there is nobody to ask and the section is entered
    /// straight away.
    pub fn request_entry(&mut self) -> Result<Step, EngineError> {
        match self.phase {
            Phase::Requesting => return Err(EngineError::AlreadyRequesting),
            Phase::InCriticalSection => return Err(EngineError::AlreadyInCriticalSection),
            Phase::Idle => {}
        }

        let saved_clock = self.clock.clone();
        let clock = self.clock.tick();
        self.request = Some(RequestStamp::new(clock, self.config.me));
        self.phase = Phase::Requesting;
        self.grants.clear();
        info!(peer = %self.config.me, clock, "requesting critical section");

        let mut step = Step::send(self.broadcast_request(clock));
        if self.config.peers.quorum() == 0 {
            match self.enter_critical_section(self.config.role.access()) {
                Ok(outcome) => step.entered = Some(outcome),
                Err(e) => {
                    // No peer was asked; roll the request back
                    self.clock = saved_clock;
                    self.request = None;
                    self.phase = Phase::Idle;
                    warn!(peer = %self.config.me, error = %e, "could not enter critical section");
                    return Err(e);
                }
            }
        }
        Ok(step)
    }

    /// Re-issue the outstanding request with a fresh clock.
    ///
    /// Grants collected for the old clock are dropped. Queued requests that
    /// now order before the new stamp are granted immediately, otherwise
    /// both sides could end up deferring each other.
    pub fn rebroadcast_request(&mut self) -> Result<Step, EngineError> {
        match self.phase {
            Phase::Idle => return Err(EngineError::NotRequesting),
            Phase::InCriticalSection => return Err(EngineError::AlreadyInCriticalSection),
            Phase::Requesting => {}
        }

        let clock = self.clock.tick();
        let stamp = RequestStamp::new(clock, self.config.me);
        self.request = Some(stamp);
        self.grants.clear();
        warn!(peer = %self.config.me, clock, "re-broadcasting request");

        let mut outbound: Vec<Envelope> = self
            .deferred
            .take_preceding(stamp)
            .into_iter()
            .map(|entry| self.ack_for(entry))
            .collect();
        outbound.extend(self.broadcast_request(clock));
        Ok(Step::send(outbound))
    }

    /// Abandon the outstanding request and release everyone we deferred.
    pub fn cancel_request(&mut self) -> Result<Step, EngineError> {
        match self.phase {
            Phase::Idle => return Err(EngineError::NotRequesting),
            Phase::InCriticalSection => return Err(EngineError::AlreadyInCriticalSection),
            Phase::Requesting => {}
        }

        warn!(
            peer = %self.config.me,
            clock = self.request.map(|s| s.clock),
            grants = self.grants.len(),
            "request cancelled"
        );
        self.phase = Phase::Idle;
        self.request = None;
        self.grants.clear();
        Ok(Step::send(self.drain_deferred()))
    }

    /// Take the resource once every grant is in and perform `action`.
    pub fn enter_critical_section(&mut self, action: Access) -> Result<AccessOutcome, EngineError> {
        let stamp = match (self.phase, self.request) {
            (Phase::Requesting, Some(stamp)) => stamp,
            (Phase::InCriticalSection, _) => return Err(EngineError::AlreadyInCriticalSection),
            _ => return Err(EngineError::NotRequesting),
        };
        let needed = self.config.peers.quorum();
        if self.grants.len() < needed {
            return Err(EngineError::GrantsOutstanding {
                received: self.grants.len(),
                needed,
            });
        }

        let capacity = self.resource.capacity();
        let outcome = match action {
            Access::Read => {
                let position = self.chooser.read_position(capacity);
                let value = self.resource.read(position)?;
                AccessOutcome::Read { position, value }
            }
            Access::Write => {
                let (position, value) = self.chooser.write_target(capacity);
                if !self.resource.write(position, value, stamp)? {
                    return Err(EngineError::WriteSuperseded { position });
                }
                AccessOutcome::Write(Mutation {
                    position,
                    value,
                    stamp,
                })
            }
        };

        self.phase = Phase::InCriticalSection;
        info!(peer = %self.config.me, clock = stamp.clock, ?outcome, "entered critical section");
        Ok(outcome)
    }

    /// Leave the critical section.
    ///
    /// A mutation is broadcast before any deferred grant goes out, so a
    /// peer we unblock has the new value queued ahead of our ACK.
    pub fn release_critical_section(
        &mut self,
        mutation: Option<Mutation>,
    ) -> Result<Step, EngineError> {
        if self.phase != Phase::InCriticalSection {
            return Err(EngineError::NotInCriticalSection);
        }

        self.phase = Phase::Idle;
        let clock = self.request.take().map(|s| s.clock);
        self.grants.clear();

        let mut outbound = Vec::new();
        if let Some(mutation) = mutation {
            outbound.extend(self.propagator.propagate(mutation));
        }
        let waiting = self.deferred.len();
        outbound.extend(self.drain_deferred());

        info!(peer = %self.config.me, ?clock, released_to = waiting, "released critical section");
        Ok(Step::send(outbound))
    }

    // ─── Inbound messages ──────────────────────────────────────────────

    /// Dispatch one inbound message
    pub fn handle_message(&mut self, message: Message) -> Step {
        let from = message.sender;
        if from == self.config.me || !self.config.peers.contains(from) {
            warn!(
                peer = %self.config.me,
                %from,
                kind = message.label(),
                "dropping message from unknown sender"
            );
            return Step::default();
        }

        match message.kind {
            MessageKind::Request { clock } => self.handle_request(from, clock),
            MessageKind::Ack { clock } => self.handle_ack(from, clock),
            MessageKind::Update {
                position,
                value,
                clock,
            } => self.handle_update(from, position, value, clock),
        }
    }

    pub fn handle_request(&mut self, from: PeerId, clock: LogicalTime) -> Step {
        self.clock.observe(clock);
        let incoming = RequestStamp::new(clock, from);

        match PermissionRule::decide(self.is_using_resource(), self.request, incoming) {
            Verdict::Grant => {
                // A stale entry from an earlier request of the same peer is
                // superseded by this grant.
                self.deferred.remove(from);
                debug!(peer = %self.config.me, %from, clock, "granting request");
                Step::send(vec![Envelope::new(from, Message::ack(self.config.me, clock))])
            }
            Verdict::Defer(reason) => {
                self.deferred.defer(from, clock);
                debug!(
                    peer = %self.config.me,
                    %from,
                    clock,
                    ?reason,
                    queued = self.deferred.len(),
                    "deferring request"
                );
                Step::default()
            }
        }
    }

    pub fn handle_ack(&mut self, from: PeerId, clock: LogicalTime) -> Step {
        let stamp = match (self.phase, self.request) {
            (Phase::Requesting, Some(stamp)) => stamp,
            _ => {
                debug!(peer = %self.config.me, %from, clock, phase = ?self.phase, "ignoring ack");
                return Step::default();
            }
        };
        if stamp.clock != clock {
            debug!(
                peer = %self.config.me,
                %from,
                clock,
                current = stamp.clock,
                "ignoring stale ack"
            );
            return Step::default();
        }
        if !self.grants.insert(from) {
            debug!(peer = %self.config.me, %from, "duplicate ack");
            return Step::default();
        }

        debug!(
            peer = %self.config.me,
            %from,
            grants = self.grants.len(),
            needed = self.config.peers.quorum(),
            "ack received"
        );
        if self.grants.len() < self.config.peers.quorum() {
            return Step::default();
        }

        match self.enter_critical_section(self.config.role.access()) {
            Ok(outcome) => Step {
                entered: Some(outcome),
                ..Step::default()
            },
            Err(e) => {
                warn!(peer = %self.config.me, error = %e, "could not enter critical section");
                self.cancel_request().unwrap_or_default()
            }
        }
    }

    pub fn handle_update(
        &mut self,
        from: PeerId,
        position: usize,
        value: i64,
        clock: LogicalTime,
    ) -> Step {
        let stamp = RequestStamp::new(clock, from);
        match self.resource.apply_update(position, value, stamp) {
            Ok(true) => {
                info!(peer = %self.config.me, %from, position, value, "applied update");
                Step {
                    applied: Some(Mutation {
                        position,
                        value,
                        stamp,
                    }),
                    ..Step::default()
                }
            }
            Ok(false) => Step::default(),
            Err(e) => {
                warn!(peer = %self.config.me, %from, error = %e, "protocol violation in update");
                Step::default()
            }
        }
    }

    // ─── Helpers ───────────────────────────────────────────────────────

    fn broadcast_request(&self, clock: LogicalTime) -> Vec<Envelope> {
        self.config
            .peers
            .others(self.config.me)
            .map(|peer| Envelope::new(peer, Message::request(self.config.me, clock)))
            .collect()
    }

    fn ack_for(&self, entry: DeferredEntry) -> Envelope {
        Envelope::new(entry.peer, Message::ack(self.config.me, entry.clock))
    }

    fn drain_deferred(&mut self) -> Vec<Envelope> {
        let me = self.config.me;
        self.deferred
            .drain()
            .map(|entry| Envelope::new(entry.peer, Message::ack(me, entry.clock)))
            .collect()
    }
}
