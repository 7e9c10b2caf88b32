//! # psyquest
//!
//! Adaptive QUEST trial scheduling for psychophysics experiments.
//!
//! This crate runs the non-visual half of a detection-threshold experiment:
//! - Per-condition Bayesian QUEST staircases (Watson & Pelli) proposing the
//!   next stimulus intensity
//! - Randomized condition scheduling with anti-repeat exclusion
//! - Balanced catch trials scored against a throwaway ghost staircase
//! - A full session snapshot after every response: sessions survive crashes
//!   and support undo
//! - CSV export of every recorded trial
//!
//! Windowing, stimulus drawing, and input capture stay outside; the
//! [`render`] module defines the seams they plug into.
//!
//! ## Common Pitfall: Catch Trials Are Scored Inverted
//!
//! On a catch trial the artifact is withheld, so "I saw it" is the *wrong*
//! answer. [`QuestScheduler::record_response`] handles the inversion; feed it
//! what the subject reported, never a pre-scored correctness flag.
//!
//! ## Quick Start
//!
//! ```ignore
//! use psyquest::{Condition, SchedulerConfig, TrialResponse, Selection, QuestError};
//!
//! let conditions = vec![
//!     Condition::new("angle1 noise0 speed0")
//!         .prior_threshold(0.7)
//!         .trial_budget(20)
//!         .extra("filter_radius", 100.0),
//!     Condition::new("angle2 noise1 speed0")
//!         .prior_threshold(0.7)
//!         .trial_budget(20)
//!         .extra("filter_radius", 60.0),
//! ];
//!
//! let mut scheduler = SchedulerConfig::new()
//!     .user("s01")
//!     .data_dir("data/s01")
//!     .reference_probability(0.2)
//!     .seed(42)
//!     .build(conditions)?;
//!
//! loop {
//!     let trial = match scheduler.next_trial() {
//!         Ok(trial) => trial,
//!         Err(QuestError::Exhausted) => break,
//!         Err(e) => return Err(e.into()),
//!     };
//!     // present `trial.condition` at `trial.intensity`, wait for input...
//!     let response = TrialResponse::seen(Selection::Left, 420.0, 310.0, elapsed);
//!     scheduler.record_response(response)?;
//! }
//!
//! scheduler.export_csv("data/s01/result.csv")?;
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Core modules
mod condition;
mod error;
mod recorder;
mod reference;
mod scheduler;
mod staircase;
mod types;

// Functional modules
pub mod persistence;
pub mod render;

// Re-exports for public API
pub use condition::Condition;
pub use error::{PersistenceError, QuestError, QuestResult};
pub use persistence::{PersistenceStore, SNAPSHOT_VERSION};
pub use recorder::{TrialRecord, TrialRecorder};
pub use reference::ReferenceBag;
pub use scheduler::{NextTrial, Progress, QuestScheduler, SchedulerConfig};
pub use staircase::Staircase;
pub use types::{IntensityChange, Selection, TrialResponse};

// Re-export the render seams for convenience
pub use render::{PresentationUi, SharedStimulus, StimulusParams, StimulusRenderer};
