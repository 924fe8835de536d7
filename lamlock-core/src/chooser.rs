//! Picks the slot (and, for writes, the value) touched inside a critical
//! section. Injectable so tests can pin exact outcomes.

use std::collections::VecDeque;

use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

/// Written values are drawn from `0..WRITE_VALUE_LIMIT`
pub const WRITE_VALUE_LIMIT: i64 = 100;

pub trait AccessChooser: Send + Sync {
    /// Slot to read, in `0..capacity`
    fn read_position(&mut self, capacity: usize) -> usize;

    /// Slot and value to write, slot in `0..capacity`
    fn write_target(&mut self, capacity: usize) -> (usize, i64);
}

/// Seeded pseudo-random choice. Same seed, same sequence.
pub struct RandomChooser {
    rng: ChaCha8Rng,
}

impl RandomChooser {
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: ChaCha8Rng::seed_from_u64(seed),
        }
    }
}

impl AccessChooser for RandomChooser {
    fn read_position(&mut self, capacity: usize) -> usize {
        self.rng.gen_range(0..capacity.max(1))
    }

    fn write_target(&mut self, capacity: usize) -> (usize, i64) {
        let position = self.rng.gen_range(0..capacity.max(1));
        let value = self.rng.gen_range(0..WRITE_VALUE_LIMIT);
        (position, value)
    }
}

/// Replays fixed choices in order, then falls back to slot 0 / value 0.
#[derive(Debug, Default)]
pub struct ScriptedChooser {
    reads: VecDeque<usize>,
    writes: VecDeque<(usize, i64)>,
}

impl ScriptedChooser {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_reads(mut self, reads: impl IntoIterator<Item = usize>) -> Self {
        self.reads.extend(reads);
        self
    }

    pub fn with_writes(mut self, writes: impl IntoIterator<Item = (usize, i64)>) -> Self {
        self.writes.extend(writes);
        self
    }
}

impl AccessChooser for ScriptedChooser {
    fn read_position(&mut self, _capacity: usize) -> usize {
        self.reads.pop_front().unwrap_or(0)
    }

    fn write_target(&mut self, _capacity: usize) -> (usize, i64) {
        self.writes.pop_front().unwrap_or((0, 0))
    }
}
