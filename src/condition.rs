//! Experimental condition parameters.
//!
//! A [`Condition`] bundles everything one staircase needs — the QUEST prior
//! and psychometric shape — together with opaque stimulus parameters the
//! scheduler never interprets (artifact size, line angle, velocity and the
//! like). The opaque parameters ride along into every exported CSV row and
//! are handed to the renderer untouched.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Parameters of one experimental condition.
///
/// Defaults describe a two-alternative artifact detection task: guess rate
/// 0.5, a shallow lapse rate, and a prior threshold at 0.7 of the nominal
/// stimulus scale. Override per condition through the builder methods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Condition {
    /// Unique label; the grouping key for recording and CSV export.
    pub label: String,

    // =========================================================================
    // QUEST prior
    // =========================================================================
    /// Prior threshold estimate in linear intensity units. Must be positive.
    pub prior_threshold: f64,
    /// Prior standard deviation in log-intensity units.
    pub prior_sd: f64,

    // =========================================================================
    // Psychometric shape (Weibull)
    // =========================================================================
    /// Slope (beta) of the psychometric function.
    pub slope: f64,
    /// Guess rate (gamma): chance performance at vanishing intensity.
    pub guess_rate: f64,
    /// Lapse rate (delta): residual error rate at arbitrarily high intensity.
    pub lapse_rate: f64,

    // =========================================================================
    // Sampling
    // =========================================================================
    /// Log-intensity grid resolution for the discretized posterior.
    pub grain: f64,
    /// Accepted real responses before this condition is finished.
    pub trial_budget: usize,

    /// Opaque experiment parameters, passed through to the renderer and the
    /// CSV export without interpretation.
    pub extra: BTreeMap<String, Value>,
}

impl Condition {
    /// A condition with the given label and default parameters.
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            prior_threshold: 0.7,
            prior_sd: 0.2,
            slope: 3.5,
            guess_rate: 0.5,
            lapse_rate: 0.01,
            grain: 0.1,
            trial_budget: 20,
            extra: BTreeMap::new(),
        }
    }

    // =========================================================================
    // Builder methods
    // =========================================================================

    /// Set the prior threshold estimate (linear intensity).
    pub fn prior_threshold(mut self, threshold: f64) -> Self {
        assert!(
            threshold > 0.0 && threshold.is_finite(),
            "prior_threshold must be positive and finite"
        );
        self.prior_threshold = threshold;
        self
    }

    /// Set the prior standard deviation (log-intensity units).
    pub fn prior_sd(mut self, sd: f64) -> Self {
        assert!(sd > 0.0 && sd.is_finite(), "prior_sd must be positive");
        self.prior_sd = sd;
        self
    }

    /// Set the psychometric slope (beta).
    pub fn slope(mut self, beta: f64) -> Self {
        assert!(beta > 0.0, "slope must be positive");
        self.slope = beta;
        self
    }

    /// Set the guess rate (gamma).
    pub fn guess_rate(mut self, gamma: f64) -> Self {
        assert!((0.0..1.0).contains(&gamma), "guess_rate must be in [0, 1)");
        self.guess_rate = gamma;
        self
    }

    /// Set the lapse rate (delta).
    pub fn lapse_rate(mut self, delta: f64) -> Self {
        assert!((0.0..1.0).contains(&delta), "lapse_rate must be in [0, 1)");
        self.lapse_rate = delta;
        self
    }

    /// Set the log-intensity grid resolution.
    pub fn grain(mut self, grain: f64) -> Self {
        assert!(grain > 0.0 && grain.is_finite(), "grain must be positive");
        self.grain = grain;
        self
    }

    /// Set the number of real responses this condition accepts.
    pub fn trial_budget(mut self, budget: usize) -> Self {
        assert!(budget > 0, "trial_budget must be positive");
        self.trial_budget = budget;
        self
    }

    /// Attach an opaque experiment parameter (renderer input, CSV column).
    pub fn extra(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Numeric view of an opaque parameter, when it is a number.
    pub fn extra_f64(&self, key: &str) -> Option<f64> {
        self.extra.get(key).and_then(Value::as_f64)
    }

    /// Validate parameter combinations the builder methods cannot check
    /// individually.
    pub fn validate(&self) -> Result<(), String> {
        if self.label.is_empty() {
            return Err("label must not be empty".to_string());
        }
        if !(self.prior_threshold > 0.0 && self.prior_threshold.is_finite()) {
            return Err("prior_threshold must be positive and finite".to_string());
        }
        if !(self.prior_sd > 0.0 && self.prior_sd.is_finite()) {
            return Err("prior_sd must be positive and finite".to_string());
        }
        if self.slope <= 0.0 {
            return Err("slope must be positive".to_string());
        }
        if !(0.0..1.0).contains(&self.guess_rate) {
            return Err("guess_rate must be in [0, 1)".to_string());
        }
        if !(0.0..1.0).contains(&self.lapse_rate) {
            return Err("lapse_rate must be in [0, 1)".to_string());
        }
        if self.guess_rate + self.lapse_rate >= 1.0 {
            return Err("guess_rate + lapse_rate must be < 1".to_string());
        }
        if self.grain <= 0.0 || !self.grain.is_finite() {
            return Err("grain must be positive and finite".to_string());
        }
        if self.trial_budget == 0 {
            return Err("trial_budget must be positive".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let c = Condition::new("angle1 noise0 speed0");
        assert!(c.validate().is_ok());
        assert_eq!(c.guess_rate, 0.5);
        assert_eq!(c.trial_budget, 20);
    }

    #[test]
    fn test_builder_methods() {
        let c = Condition::new("fast")
            .prior_threshold(0.5)
            .prior_sd(0.3)
            .slope(3.0)
            .guess_rate(0.25)
            .lapse_rate(0.02)
            .grain(0.05)
            .trial_budget(40)
            .extra("filter_radius", 100.0)
            .extra("velocity", 12);

        assert!(c.validate().is_ok());
        assert_eq!(c.prior_threshold, 0.5);
        assert_eq!(c.trial_budget, 40);
        assert_eq!(c.extra_f64("filter_radius"), Some(100.0));
        assert_eq!(c.extra_f64("velocity"), Some(12.0));
        assert_eq!(c.extra_f64("missing"), None);
    }

    #[test]
    fn test_validation_catches_empty_label() {
        let c = Condition::new("");
        assert!(c.validate().is_err());
    }

    #[test]
    fn test_validation_catches_saturated_rates() {
        // Individually legal, jointly impossible: gamma + delta >= 1 leaves
        // no room for the psychometric function to rise.
        let mut c = Condition::new("sat");
        c.guess_rate = 0.6;
        c.lapse_rate = 0.5;
        assert!(c.validate().is_err());
    }

    #[test]
    #[should_panic(expected = "prior_threshold must be positive")]
    fn test_negative_threshold_panics() {
        let _ = Condition::new("bad").prior_threshold(-1.0);
    }

    #[test]
    #[should_panic(expected = "guess_rate must be in [0, 1)")]
    fn test_guess_rate_of_one_panics() {
        let _ = Condition::new("bad").guess_rate(1.0);
    }

    #[test]
    fn test_serde_round_trip() {
        let c = Condition::new("angle2").extra("artifact_size", 8.0);
        let json = serde_json::to_string(&c).unwrap();
        let back: Condition = serde_json::from_str(&json).unwrap();
        assert_eq!(c, back);
    }
}
