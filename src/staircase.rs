//! Discretized Bayesian QUEST estimator for one condition.
//!
//! The classic adaptive staircase of Watson & Pelli: a posterior over
//! candidate log thresholds, updated after every response and queried for the
//! next stimulus intensity.
//!
//! - **Grid**: candidate thresholds are discretized in natural-log intensity,
//!   centered on `ln(prior_threshold)` at step `grain`, spanning at least
//!   ±4 prior standard deviations.
//! - **Prior**: Gaussian over the grid with mean `ln(prior_threshold)` and
//!   standard deviation `prior_sd`, normalized to unit mass.
//! - **Likelihood**: Weibull psychometric function in linear intensity. For a
//!   correct response at intensity `x` against candidate threshold `t`:
//!
//!   `P(correct | x, t) = gamma + (1 - gamma - delta) * (1 - exp(-(x/t)^beta))`
//!
//!   and the complement for an error.
//! - **Update**: pointwise multiply, renormalize. The update is plain `f64`
//!   arithmetic in grid order, so identical inputs reproduce bit-identical
//!   posteriors.
//!
//! The proposed intensity is the posterior mean in log space mapped back to
//! linear units. It is deterministic: no sampling happens here.

use serde::{Deserialize, Serialize};

use crate::condition::Condition;
use crate::error::{QuestError, QuestResult};

/// Renormalization floor, just above the subnormal range. An update whose
/// unnormalized mass lands below this has lost the posterior; the staircase
/// reseeds a uniform prior and reports the collapse.
const POSTERIOR_SUM_FLOOR: f64 = 1e-300;

/// Adaptive threshold estimator for a single condition.
///
/// Cloning a staircase copies the posterior by value; the scheduler uses this
/// for ghost copies on catch trials, which must never touch the original.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Staircase {
    label: String,
    slope: f64,
    guess_rate: f64,
    lapse_rate: f64,
    trial_budget: usize,
    /// Candidate thresholds, natural-log intensity, ascending.
    grid: Vec<f64>,
    /// Probability mass per grid point; sums to 1.
    posterior: Vec<f64>,
    /// Intensities presented so far; one ahead of `responses` while a
    /// proposal is outstanding.
    intensities: Vec<f64>,
    responses: Vec<bool>,
    pending: bool,
    collapses: u32,
}

impl Staircase {
    /// Build the grid and seed the Gaussian prior from a condition.
    pub fn new(condition: &Condition) -> Self {
        let mu = condition.prior_threshold.ln();
        let sigma = condition.prior_sd;
        let grain = condition.grain;

        let half_span = (4.0 * sigma).max(2.0 * grain);
        let steps = (half_span / grain).ceil() as i64;
        let grid: Vec<f64> = (-steps..=steps).map(|i| mu + i as f64 * grain).collect();

        let mut posterior: Vec<f64> = grid
            .iter()
            .map(|&t| (-0.5 * ((t - mu) / sigma).powi(2)).exp())
            .collect();
        normalize(&mut posterior);

        Self {
            label: condition.label.clone(),
            slope: condition.slope,
            guess_rate: condition.guess_rate,
            lapse_rate: condition.lapse_rate,
            trial_budget: condition.trial_budget,
            grid,
            posterior,
            intensities: Vec::new(),
            responses: Vec::new(),
            pending: false,
            collapses: 0,
        }
    }

    /// Propose the next stimulus intensity and mark it outstanding.
    ///
    /// Errors with [`QuestError::Exhausted`] once the trial budget is
    /// consumed, and [`QuestError::InvalidState`] when a proposal is already
    /// awaiting its response.
    pub fn next_intensity(&mut self) -> QuestResult<f64> {
        if self.finished() {
            return Err(QuestError::Exhausted);
        }
        if self.pending {
            return Err(QuestError::invalid_state(
                "next_intensity() while a proposal is already outstanding",
            ));
        }
        let intensity = self.threshold_estimate();
        self.intensities.push(intensity);
        self.pending = true;
        Ok(intensity)
    }

    /// Record the response to the outstanding proposal and update the
    /// posterior.
    ///
    /// A [`QuestError::NumericalCollapse`] return means the posterior
    /// underflowed and was reseeded uniform; the response is still counted
    /// and the staircase remains usable.
    pub fn add_response(&mut self, correct: bool) -> QuestResult<()> {
        if self.finished() {
            return Err(QuestError::Exhausted);
        }
        let intensity = match self.intensities.last() {
            Some(&x) if self.pending => x,
            _ => {
                return Err(QuestError::invalid_state(
                    "add_response() with no proposal outstanding",
                ))
            }
        };
        self.pending = false;
        self.responses.push(correct);
        self.apply_update(intensity, correct)
    }

    /// Replay a trial observed elsewhere (resuming from exported data).
    ///
    /// Not legal while a proposal is outstanding.
    pub fn import_trial(&mut self, intensity: f64, correct: bool) -> QuestResult<()> {
        if self.finished() {
            return Err(QuestError::Exhausted);
        }
        if self.pending {
            return Err(QuestError::invalid_state(
                "import_trial() while a proposal is outstanding",
            ));
        }
        self.intensities.push(intensity);
        self.responses.push(correct);
        self.apply_update(intensity, correct)
    }

    /// Current threshold estimate: posterior mean in log space, exponentiated
    /// back to linear intensity. Does not mark a proposal.
    pub fn threshold_estimate(&self) -> f64 {
        let mean_log: f64 = self
            .posterior
            .iter()
            .zip(&self.grid)
            .map(|(&p, &t)| p * t)
            .sum();
        mean_log.exp()
    }

    /// The outstanding proposal, when one is awaiting its response.
    pub fn pending_intensity(&self) -> Option<f64> {
        if self.pending {
            self.intensities.last().copied()
        } else {
            None
        }
    }

    /// True once `trial_budget` responses have been accepted.
    pub fn finished(&self) -> bool {
        self.responses.len() >= self.trial_budget
    }

    /// Condition label this staircase estimates.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Responses accepted so far.
    pub fn responses(&self) -> &[bool] {
        &self.responses
    }

    /// Intensities proposed so far (one ahead of responses while a proposal
    /// is outstanding).
    pub fn intensities(&self) -> &[f64] {
        &self.intensities
    }

    /// Posterior mass per grid point.
    pub fn posterior(&self) -> &[f64] {
        &self.posterior
    }

    /// How many times the posterior collapsed and was reseeded.
    pub fn collapse_count(&self) -> u32 {
        self.collapses
    }

    /// Likelihood of the observed response at intensity `x` for candidate
    /// log threshold `log_t`.
    fn likelihood(&self, x: f64, log_t: f64, correct: bool) -> f64 {
        let ratio = x / log_t.exp();
        // ratio^beta overflows to +inf for extreme ratios; exp(-inf) = 0
        // saturates the Weibull cleanly.
        let p_correct = self.guess_rate
            + (1.0 - self.guess_rate - self.lapse_rate) * (1.0 - (-ratio.powf(self.slope)).exp());
        if correct {
            p_correct
        } else {
            1.0 - p_correct
        }
    }

    fn apply_update(&mut self, intensity: f64, correct: bool) -> QuestResult<()> {
        let mut updated: Vec<f64> = self
            .posterior
            .iter()
            .zip(&self.grid)
            .map(|(&p, &t)| p * self.likelihood(intensity, t, correct))
            .collect();
        let sum: f64 = updated.iter().sum();

        if sum >= POSTERIOR_SUM_FLOOR {
            for p in &mut updated {
                *p /= sum;
            }
            self.posterior = updated;
            return Ok(());
        }

        // Collapse: reseed uniform and give the observation one more chance
        // against the flat prior. If even that underflows, stay uniform.
        self.collapses += 1;
        let n = self.grid.len() as f64;
        let mut reseeded: Vec<f64> = self
            .grid
            .iter()
            .map(|&t| self.likelihood(intensity, t, correct) / n)
            .collect();
        let retry_sum: f64 = reseeded.iter().sum();
        if retry_sum >= POSTERIOR_SUM_FLOOR {
            for p in &mut reseeded {
                *p /= retry_sum;
            }
            self.posterior = reseeded;
        } else {
            self.posterior = vec![1.0 / n; self.grid.len()];
        }
        Err(QuestError::NumericalCollapse {
            label: self.label.clone(),
            sum,
        })
    }
}

fn normalize(mass: &mut [f64]) {
    let sum: f64 = mass.iter().sum();
    for p in mass.iter_mut() {
        *p /= sum;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn condition() -> Condition {
        Condition::new("unit").prior_threshold(0.5).trial_budget(20)
    }

    fn posterior_mass(s: &Staircase) -> f64 {
        s.posterior().iter().sum()
    }

    #[test]
    fn test_prior_mass_is_one() {
        let s = Staircase::new(&condition());
        assert!((posterior_mass(&s) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_first_proposal_is_prior_mean() {
        let mut s = Staircase::new(&condition());
        let x = s.next_intensity().unwrap();
        // Symmetric Gaussian prior on a symmetric grid: mean log threshold
        // is the center point.
        assert!((x - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_mass_preserved_across_updates() {
        let mut s = Staircase::new(&condition());
        for i in 0..10 {
            s.next_intensity().unwrap();
            s.add_response(i % 2 == 0).unwrap();
            assert!((posterior_mass(&s) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_correct_responses_drive_estimates_down() {
        // Twenty consecutive correct responses: the observer resolves the
        // stimulus easily, so the threshold estimate must fall every trial.
        let c = Condition::new("b")
            .prior_threshold(0.5)
            .slope(3.5)
            .guess_rate(0.5)
            .lapse_rate(0.01)
            .trial_budget(20);
        let mut s = Staircase::new(&c);

        let mut previous = f64::INFINITY;
        for _ in 0..20 {
            let proposed = s.next_intensity().unwrap();
            assert!(
                proposed <= previous,
                "estimate rose: {} -> {}",
                previous,
                proposed
            );
            previous = proposed;
            s.add_response(true).unwrap();
        }
        let first = s.intensities()[0];
        let last = *s.intensities().last().unwrap();
        assert!(last < first, "estimates never moved: {} -> {}", first, last);
    }

    #[test]
    fn test_budget_is_exact() {
        let c = condition().trial_budget(5);
        let mut s = Staircase::new(&c);
        for _ in 0..5 {
            assert!(!s.finished());
            s.next_intensity().unwrap();
            s.add_response(true).unwrap();
        }
        assert!(s.finished());
        assert!(matches!(s.next_intensity(), Err(QuestError::Exhausted)));
        assert!(matches!(
            s.import_trial(0.5, true),
            Err(QuestError::Exhausted)
        ));
        assert_eq!(s.responses().len(), 5);
        assert_eq!(s.intensities().len(), 5);
    }

    #[test]
    fn test_response_without_proposal_is_invalid() {
        let mut s = Staircase::new(&condition());
        assert!(matches!(
            s.add_response(true),
            Err(QuestError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_double_proposal_is_invalid() {
        let mut s = Staircase::new(&condition());
        s.next_intensity().unwrap();
        assert!(matches!(
            s.next_intensity(),
            Err(QuestError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_import_while_pending_is_invalid() {
        let mut s = Staircase::new(&condition());
        s.next_intensity().unwrap();
        assert!(matches!(
            s.import_trial(0.4, false),
            Err(QuestError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_replay_reproduces_posterior_bitwise() {
        let c = condition();
        let mut live = Staircase::new(&c);
        let mut pairs = Vec::new();
        let answers = [true, true, false, true, false, false, true, true];
        for &correct in &answers {
            let x = live.next_intensity().unwrap();
            live.add_response(correct).unwrap();
            pairs.push((x, correct));
        }

        let mut replay = Staircase::new(&c);
        for (x, correct) in pairs {
            replay.import_trial(x, correct).unwrap();
        }

        assert_eq!(live.posterior().len(), replay.posterior().len());
        for (a, b) in live.posterior().iter().zip(replay.posterior()) {
            assert_eq!(a.to_bits(), b.to_bits());
        }
    }

    #[test]
    fn test_collapse_reseeds_uniform() {
        // gamma 0 and delta 0 leave the likelihood unguarded: a "correct"
        // response at an absurdly small intensity underflows every grid
        // point and must trigger the uniform reseed.
        let c = Condition::new("collapse")
            .prior_threshold(1.0)
            .prior_sd(0.1)
            .guess_rate(0.0)
            .lapse_rate(0.0)
            .trial_budget(10);
        let mut s = Staircase::new(&c);

        let err = s.import_trial(1e-200, true).unwrap_err();
        assert!(matches!(err, QuestError::NumericalCollapse { .. }));
        assert_eq!(s.collapse_count(), 1);
        assert_eq!(s.responses().len(), 1);
        // Posterior is the uniform distribution and still sums to one.
        let n = s.posterior().len() as f64;
        for &p in s.posterior() {
            assert!((p - 1.0 / n).abs() < 1e-12);
        }
        assert!((posterior_mass(&s) - 1.0).abs() < 1e-9);
        // The staircase keeps working afterwards.
        s.next_intensity().unwrap();
        s.add_response(false).unwrap();
        assert!((posterior_mass(&s) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_clone_is_independent() {
        let mut original = Staircase::new(&condition());
        original.next_intensity().unwrap();
        original.add_response(true).unwrap();

        let frozen = original.clone();
        let before: Vec<u64> = frozen.posterior().iter().map(|p| p.to_bits()).collect();

        original.next_intensity().unwrap();
        original.add_response(false).unwrap();

        let after: Vec<u64> = frozen.posterior().iter().map(|p| p.to_bits()).collect();
        assert_eq!(before, after);
        assert_ne!(original.responses().len(), frozen.responses().len());
    }
}
