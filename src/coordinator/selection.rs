//! Participant selection.

use rand::{rngs::StdRng, seq::IteratorRandom, SeedableRng};

use crate::coordinator::directory::ClientRecord;

/// A strategy to pick the participants of a round.
#[cfg_attr(test, mockall::automock)]
pub trait Selector {
    /// Select at most `count` distinct clients among the `candidates`.
    ///
    /// If there are fewer candidates than `count`, all of them are selected.
    fn select(&mut self, count: usize, candidates: Vec<ClientRecord>) -> Vec<ClientRecord>;
}

/// Uniform selection without replacement.
pub struct RandomSelector {
    rng: StdRng,
}

impl RandomSelector {
    pub fn new() -> Self {
        Self {
            rng: StdRng::from_entropy(),
        }
    }

    /// A selector with a reproducible sequence of selections.
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }
}

impl Default for RandomSelector {
    fn default() -> Self {
        Self::new()
    }
}

impl Selector for RandomSelector {
    fn select(&mut self, count: usize, candidates: Vec<ClientRecord>) -> Vec<ClientRecord> {
        candidates
            .into_iter()
            .choose_multiple(&mut self.rng, count)
    }
}
