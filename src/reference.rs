//! Balanced catch-trial decision source.
//!
//! A naive Bernoulli draw per trial lets catch trials cluster; a bag of
//! pre-committed decisions, reshuffled per cycle, keeps the long-run ratio
//! exact while staying unpredictable trial to trial.

use rand::seq::SliceRandom;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Shuffled bag of per-trial catch decisions.
///
/// Each refill holds exactly `round(size * probability)` positive decisions,
/// so the exact ratio is guaranteed per complete cycle rather than
/// instantaneously. The remaining bag is serialized with session snapshots;
/// the RNG is supplied per call so the caller owns seeding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReferenceBag {
    size: usize,
    probability: f64,
    bag: Vec<bool>,
}

impl ReferenceBag {
    /// Default cycle length.
    pub const DEFAULT_SIZE: usize = 20;

    /// An empty bag; the first draw triggers a refill.
    pub fn new(size: usize, probability: f64) -> Self {
        assert!(size > 0, "bag size must be positive");
        assert!(
            (0.0..=1.0).contains(&probability),
            "reference probability must be in [0, 1]"
        );
        Self {
            size,
            probability,
            bag: Vec::new(),
        }
    }

    /// Decide whether the upcoming trial is a catch trial.
    pub fn next_is_reference<R: Rng>(&mut self, rng: &mut R) -> bool {
        if self.bag.is_empty() {
            self.refill(rng);
        }
        self.bag.pop().unwrap_or(false)
    }

    /// Decisions left in the current cycle.
    pub fn remaining(&self) -> usize {
        self.bag.len()
    }

    fn refill<R: Rng>(&mut self, rng: &mut R) {
        let positives = ((self.size as f64) * self.probability).round() as usize;
        let positives = positives.min(self.size);
        self.bag.clear();
        self.bag.extend(std::iter::repeat(true).take(positives));
        self.bag
            .extend(std::iter::repeat(false).take(self.size - positives));
        self.bag.shuffle(rng);
    }
}
