//! Shared response and recording types.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which alternative the subject picked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Selection {
    /// Left stimulus.
    Left,
    /// Right stimulus.
    Right,
    /// No pick (timeout, or an explicit cannot-decide).
    None,
}

impl fmt::Display for Selection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Selection::Left => "left",
            Selection::Right => "right",
            Selection::None => "none",
        };
        f.write_str(s)
    }
}

/// Direction the stimulus intensity moves after a response.
///
/// Catch trials never move the real staircase, so they record
/// [`IntensityChange::None`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntensityChange {
    /// Artifact was seen; the stimulus gets harder to see.
    Increase,
    /// Artifact was missed; the stimulus gets easier to see.
    Decrease,
    /// Catch trial; the real staircase is untouched.
    None,
}

impl fmt::Display for IntensityChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntensityChange::Increase => "increase",
            IntensityChange::Decrease => "decrease",
            IntensityChange::None => "none",
        };
        f.write_str(s)
    }
}

/// One subject response, as delivered by the presentation layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialResponse {
    /// Whether the subject reports seeing the artifact.
    pub saw_artifact: bool,
    /// Which alternative they picked.
    pub selection: Selection,
    /// Pointer position of the pick, when there was one.
    pub position: Option<(f64, f64)>,
    /// Time from stimulus onset to response.
    pub duration: Duration,
}

impl TrialResponse {
    /// A fully-specified response.
    pub fn new(
        saw_artifact: bool,
        selection: Selection,
        position: Option<(f64, f64)>,
        duration: Duration,
    ) -> Self {
        Self {
            saw_artifact,
            selection,
            position,
            duration,
        }
    }

    /// Subject reports the artifact at the given pointer position.
    pub fn seen(selection: Selection, x: f64, y: f64, duration: Duration) -> Self {
        Self::new(true, selection, Some((x, y)), duration)
    }

    /// Subject reports a clean stimulus.
    pub fn not_seen(selection: Selection, duration: Duration) -> Self {
        Self::new(false, selection, None, duration)
    }

    /// Subject explicitly cannot decide; scored as not seeing the artifact.
    pub fn cannot_decide(duration: Duration) -> Self {
        Self::new(false, Selection::None, None, duration)
    }
}
