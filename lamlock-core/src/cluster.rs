//! Deterministic in-process cluster of engines.
//!
//! Links are FIFO per (sender, receiver) pair, as one subscription is. A
//! seeded rng picks which link delivers next, when the holder releases,
//! when an idle peer starts its next round and when a waiting peer
//! re-issues its request. Same seed, same run.

use std::collections::{BTreeMap, VecDeque};

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use crate::chooser::RandomChooser;
use crate::engine::{EngineConfig, MutexEngine, Phase, Step};
use crate::error::{ConfigError, SimulationError};
use crate::resource::DEFAULT_CAPACITY;
use crate::types::{AccessOutcome, Message, Mutation, PeerId, Role};

const DEFAULT_STEP_LIMIT: usize = 1_000_000;

/// One critical-section entry seen by the cluster, in entry order
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entry {
    pub peer: PeerId,
    pub outcome: AccessOutcome,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterReport {
    pub entries: Vec<Entry>,
    /// Messages delivered over the whole run
    pub delivered: usize,
    pub retries: u32,
    /// Final replica of every peer, ordered by identity
    pub replicas: Vec<Vec<i64>>,
}

impl ClusterReport {
    /// True when every replica ended up identical
    pub fn converged(&self) -> bool {
        self.replicas.windows(2).all(|pair| pair[0] == pair[1])
    }

    pub fn entries_of(&self, peer: PeerId) -> usize {
        self.entries.iter().filter(|e| e.peer == peer).count()
    }
}

#[derive(Debug, Clone, Copy)]
enum Action {
    Deliver { from: PeerId, to: PeerId },
    Release(PeerId),
    Request(PeerId),
    Retry(PeerId),
}

pub struct Cluster {
    engines: Vec<MutexEngine>,
    links: BTreeMap<(PeerId, PeerId), VecDeque<Message>>,
    rng: ChaCha8Rng,
    rounds_left: Vec<u32>,
    retries_left: u32,
    holder: Option<(PeerId, Option<Mutation>)>,
    entries: Vec<Entry>,
    delivered: usize,
    retries: u32,
    step_limit: usize,
}

impl Cluster {
    /// One peer per role; peer `i + 1` gets `roles[i]`. Every peer runs a
    /// single round unless [`rounds`](Self::rounds) says otherwise.
    pub fn new(roles: &[Role], seed: u64) -> Result<Self, ConfigError> {
        Self::with_capacity(roles, DEFAULT_CAPACITY, seed)
    }

    pub fn with_capacity(roles: &[Role], capacity: usize, seed: u64) -> Result<Self, ConfigError> {
        if roles.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        let size = roles.len() as u32;
        let mut engines = Vec::with_capacity(roles.len());
        for (id, role) in (1..=size).zip(roles.iter().copied()) {
            let config = EngineConfig::new(id, size, role)?.with_capacity(capacity)?;
            let chooser = RandomChooser::seeded(seed.wrapping_add(u64::from(id)));
            engines.push(MutexEngine::with_chooser(config, Box::new(chooser)));
        }

        Ok(Self {
            engines,
            links: BTreeMap::new(),
            rng: ChaCha8Rng::seed_from_u64(seed),
            rounds_left: vec![1; roles.len()],
            retries_left: 0,
            holder: None,
            entries: Vec::new(),
            delivered: 0,
            retries: 0,
            step_limit: DEFAULT_STEP_LIMIT,
        })
    }

    /// Critical-section entries each peer asks for
    pub fn rounds(mut self, rounds: u32) -> Self {
        self.rounds_left.iter_mut().for_each(|r| *r = rounds);
        self
    }

    /// Total request re-issues the cluster may inject, across all peers
    pub fn retries(mut self, budget: u32) -> Self {
        self.retries_left = budget;
        self
    }

    pub fn step_limit(mut self, limit: usize) -> Self {
        self.step_limit = limit;
        self
    }

    pub fn engine(&self, peer: PeerId) -> Option<&MutexEngine> {
        let index = (peer.get() as usize).checked_sub(1)?;
        self.engines.get(index)
    }

    /// Drive the cluster until nothing is left to do.
    ///
    /// Fails on the first double entry, or when peers are still waiting
    /// with no message in flight.
    pub fn run(&mut self) -> Result<ClusterReport, SimulationError> {
        for _ in 0..self.step_limit {
            let actions = self.actions();
            if actions.is_empty() {
                let waiting = self.engines.iter().filter(|e| e.is_requesting()).count();
                if waiting > 0 {
                    return Err(SimulationError::Stalled { waiting });
                }
                return Ok(self.report());
            }
            let action = actions[self.rng.gen_range(0..actions.len())];
            self.perform(action)?;
        }
        Err(SimulationError::StepLimit(self.step_limit))
    }

    fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self
            .links
            .iter()
            .filter(|(_, queue)| !queue.is_empty())
            .map(|(&(from, to), _)| Action::Deliver { from, to })
            .collect();

        if let Some((holder, _)) = self.holder {
            actions.push(Action::Release(holder));
        }
        for (engine, rounds) in self.engines.iter().zip(&self.rounds_left) {
            match engine.phase() {
                Phase::Idle if *rounds > 0 => actions.push(Action::Request(engine.me())),
                Phase::Requesting if self.retries_left > 0 => {
                    actions.push(Action::Retry(engine.me()))
                }
                _ => {}
            }
        }
        actions
    }

    fn perform(&mut self, action: Action) -> Result<(), SimulationError> {
        debug!(?action, "cluster step");
        match action {
            Action::Deliver { from, to } => {
                let Some(message) = self.links.get_mut(&(from, to)).and_then(|q| q.pop_front())
                else {
                    return Ok(());
                };
                self.delivered += 1;
                let step = self.engine_mut(to).handle_message(message);
                self.absorb(to, step)
            }
            Action::Release(peer) => {
                let mutation = self.holder.take().and_then(|(_, mutation)| mutation);
                let step = self.engine_mut(peer).release_critical_section(mutation)?;
                self.absorb(peer, step)
            }
            Action::Request(peer) => {
                self.rounds_left[Self::index(peer)] -= 1;
                let step = self.engine_mut(peer).request_entry()?;
                self.absorb(peer, step)
            }
            Action::Retry(peer) => {
                self.retries_left -= 1;
                self.retries += 1;
                let step = self.engine_mut(peer).rebroadcast_request()?;
                self.absorb(peer, step)
            }
        }
    }

    fn absorb(&mut self, peer: PeerId, step: Step) -> Result<(), SimulationError> {
        for envelope in step.outbound {
            self.links
                .entry((peer, envelope.to))
                .or_default()
                .push_back(envelope.message);
        }
        if let Some(outcome) = step.entered {
            if let Some((holder, _)) = self.holder {
                return Err(SimulationError::MutualExclusion {
                    holder,
                    entering: peer,
                });
            }
            self.holder = Some((peer, outcome.mutation()));
            self.entries.push(Entry { peer, outcome });
        }
        Ok(())
    }

    fn report(&self) -> ClusterReport {
        ClusterReport {
            entries: self.entries.clone(),
            delivered: self.delivered,
            retries: self.retries,
            replicas: self
                .engines
                .iter()
                .map(|e| e.resource().snapshot())
                .collect(),
        }
    }

    fn index(peer: PeerId) -> usize {
        peer.get() as usize - 1
    }

    fn engine_mut(&mut self, peer: PeerId) -> &mut MutexEngine {
        &mut self.engines[Self::index(peer)]
    }
}
