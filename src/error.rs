//! Error taxonomy for scheduling, estimation, and persistence.
//!
//! Three of the four failure classes are recoverable by the caller:
//! [`QuestError::Exhausted`] is the normal end of a session,
//! [`QuestError::InvalidState`] flags a call that is illegal right now, and
//! [`QuestError::NumericalCollapse`] reports a posterior underflow that has
//! already been repaired by reseeding a uniform prior. Only
//! [`QuestError::Persistence`] is fatal: it is raised after the single write
//! retry has failed.

use std::fmt;

/// Result alias used throughout the crate.
pub type QuestResult<T> = Result<T, QuestError>;

/// Errors surfaced by the scheduler and its staircases.
#[derive(Debug)]
pub enum QuestError {
    /// Every condition has consumed its trial budget, or a single staircase
    /// was asked for a trial past its budget. Terminal: once a scheduler has
    /// returned this it keeps returning it.
    Exhausted,
    /// API misuse: the call is not legal in the current state (for example
    /// two `next_trial()` calls without an intervening response).
    InvalidState {
        /// What was attempted and why it is illegal right now.
        message: String,
    },
    /// Posterior renormalization underflowed. The staircase has already
    /// reseeded a uniform prior and re-applied the observation, so the
    /// posterior is valid; callers may log and continue.
    NumericalCollapse {
        /// Label of the condition whose posterior collapsed.
        label: String,
        /// The normalizing sum that fell below the floor.
        sum: f64,
    },
    /// Snapshot, restore, or export failure after the single retry.
    Persistence(PersistenceError),
}

impl QuestError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        QuestError::InvalidState {
            message: message.into(),
        }
    }

    /// True for the terminal end-of-session error.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, QuestError::Exhausted)
    }
}

impl fmt::Display for QuestError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuestError::Exhausted => {
                write!(f, "every condition has consumed its trial budget")
            }
            QuestError::InvalidState { message } => {
                write!(f, "invalid call: {}", message)
            }
            QuestError::NumericalCollapse { label, sum } => {
                write!(
                    f,
                    "posterior for condition '{}' collapsed (normalizing sum {:e}); reseeded uniform",
                    label, sum
                )
            }
            QuestError::Persistence(e) => write!(f, "persistence failure: {}", e),
        }
    }
}

impl std::error::Error for QuestError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            QuestError::Persistence(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PersistenceError> for QuestError {
    fn from(e: PersistenceError) -> Self {
        QuestError::Persistence(e)
    }
}

impl From<std::io::Error> for QuestError {
    fn from(e: std::io::Error) -> Self {
        QuestError::Persistence(PersistenceError::Io(e))
    }
}

/// Failures in the snapshot directory or the CSV export.
#[derive(Debug)]
pub enum PersistenceError {
    /// Filesystem failure creating, writing, renaming, or reading artifacts.
    Io(std::io::Error),
    /// Snapshot could not be encoded or decoded.
    Serialize(serde_json::Error),
    /// Artifact carries a snapshot format version this build does not read.
    Version {
        /// Version found in the artifact.
        found: u32,
        /// Version this build writes and reads.
        expected: u32,
    },
}

impl fmt::Display for PersistenceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PersistenceError::Io(e) => write!(f, "I/O error: {}", e),
            PersistenceError::Serialize(e) => write!(f, "snapshot encoding error: {}", e),
            PersistenceError::Version { found, expected } => {
                write!(
                    f,
                    "snapshot format version {} (this build reads {})",
                    found, expected
                )
            }
        }
    }
}

impl std::error::Error for PersistenceError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PersistenceError::Io(e) => Some(e),
            PersistenceError::Serialize(e) => Some(e),
            PersistenceError::Version { .. } => None,
        }
    }
}

impl From<std::io::Error> for PersistenceError {
    fn from(e: std::io::Error) -> Self {
        PersistenceError::Io(e)
    }
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialize(e)
    }
}
