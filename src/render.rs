//! Presentation-layer seams.
//!
//! The scheduler is synchronous; drawing is not. A typical setup runs the
//! render loop on its own thread, redrawing the last committed stimulus on
//! its own cadence while the scheduler thread waits for the subject.
//! [`SharedStimulus`] is the single lock between the two; the traits are the
//! interfaces a windowing backend implements.

use std::sync::{Arc, Mutex};

use crate::condition::Condition;
use crate::scheduler::NextTrial;
use crate::types::TrialResponse;

/// Draws one stimulus configuration.
///
/// How a catch trial looks (typically the same stimulus without the
/// artifact) is the renderer's decision; the scheduler only flags it.
pub trait StimulusRenderer {
    /// Reconfigure for a condition at the given intensity. Opaque condition
    /// parameters (for example `filter_radius`) are resolved against the
    /// intensity here, not in the scheduler.
    fn settings(&mut self, condition: &Condition, intensity: f64);

    /// Draw a frame; returns whether anything was drawn.
    fn render(&mut self) -> bool;
}

/// Translates raw input events into trial responses.
pub trait PresentationUi {
    /// The subject's response to the current stimulus, once one arrived.
    fn poll_response(&mut self) -> Option<TrialResponse>;
}

/// Stimulus parameters committed for display.
#[derive(Debug, Clone, PartialEq)]
pub struct StimulusParams {
    /// Active condition, opaque parameters included.
    pub condition: Condition,
    /// Intensity to present.
    pub intensity: f64,
    /// Whether the artifact is withheld this trial.
    pub is_reference: bool,
}

impl From<&NextTrial> for StimulusParams {
    fn from(trial: &NextTrial) -> Self {
        Self {
            condition: trial.condition.clone(),
            intensity: trial.intensity,
            is_reference: trial.is_reference,
        }
    }
}

/// Last-committed stimulus, shared with an independent render loop.
///
/// Cloning the handle shares the same cell.
#[derive(Debug, Clone, Default)]
pub struct SharedStimulus {
    inner: Arc<Mutex<Option<StimulusParams>>>,
}

impl SharedStimulus {
    /// An empty cell (nothing to draw yet).
    pub fn new() -> Self {
        Self::default()
    }

    /// Commit a proposed trial for display.
    pub fn commit(&self, trial: &NextTrial) {
        let mut slot = self.inner.lock().unwrap();
        *slot = Some(StimulusParams::from(trial));
    }

    /// Blank the display (inter-stimulus interval).
    pub fn clear(&self) {
        let mut slot = self.inner.lock().unwrap();
        *slot = None;
    }

    /// The stimulus to draw right now, if any.
    pub fn latest(&self) -> Option<StimulusParams> {
        self.inner.lock().unwrap().clone()
    }
}
