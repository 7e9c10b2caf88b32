//! Session orchestration: condition scheduling, catch trials, undo.
//!
//! The scheduler is a small synchronous state machine. SELECTING proposes a
//! trial, AWAITING_RESPONSE consumes exactly one response, and the session is
//! FINISHED once every staircase has spent its budget:
//!
//! - A condition keeps re-proposing until the subject reports seeing the
//!   artifact (or the condition finishes); then the scheduler switches,
//!   avoiding recently used conditions.
//! - Catch trials run against a throwaway copy of the active staircase (the
//!   "ghost"), so a trial with no artifact can be scored without moving the
//!   real posterior.
//! - Every response ends with a full state snapshot; `undo()` rewinds to the
//!   previous one and re-presents the undone trial bit-identically, because
//!   the RNG rides inside the snapshot.

use std::collections::VecDeque;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::condition::Condition;
use crate::error::{QuestError, QuestResult};
use crate::persistence::{move_aside, PersistenceStore};
use crate::recorder::{TrialRecord, TrialRecorder};
use crate::reference::ReferenceBag;
use crate::staircase::Staircase;
use crate::types::{IntensityChange, TrialResponse};

/// Session-level settings, separate from the per-condition parameters.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Subject identifier, recorded on every trial row.
    pub user: String,
    /// Snapshot directory; created if missing. A directory that already
    /// holds snapshots resumes that session.
    pub data_dir: PathBuf,
    /// Long-run fraction of catch trials, in [0, 1].
    pub reference_probability: f64,
    /// Catch-decision bag size (the cycle over which the fraction is exact).
    pub reference_bag_size: usize,
    /// RNG seed; `None` draws one from the thread RNG. The effective seed is
    /// kept in session state either way.
    pub seed: Option<u64>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            user: "anonymous".to_string(),
            data_dir: PathBuf::from("data"),
            reference_probability: 0.2,
            reference_bag_size: ReferenceBag::DEFAULT_SIZE,
            seed: None,
        }
    }
}

impl SchedulerConfig {
    /// Default settings.
    pub fn new() -> Self {
        Self::default()
    }

    // =========================================================================
    // Builder methods
    // =========================================================================

    /// Set the subject identifier.
    pub fn user(mut self, user: impl Into<String>) -> Self {
        self.user = user.into();
        self
    }

    /// Set the snapshot directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = dir.into();
        self
    }

    /// Set the long-run fraction of catch trials.
    pub fn reference_probability(mut self, p: f64) -> Self {
        assert!(
            (0.0..=1.0).contains(&p),
            "reference_probability must be in [0, 1]"
        );
        self.reference_probability = p;
        self
    }

    /// Set the catch-decision bag size.
    pub fn reference_bag_size(mut self, size: usize) -> Self {
        assert!(size > 0, "reference_bag_size must be positive");
        self.reference_bag_size = size;
        self
    }

    /// Fix the RNG seed for a reproducible session.
    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build a scheduler over the given conditions.
    pub fn build(self, conditions: Vec<Condition>) -> QuestResult<QuestScheduler> {
        QuestScheduler::new(self, conditions)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum Phase {
    Selecting,
    AwaitingResponse,
    Finished,
}

/// Everything a snapshot captures. Restoring one of these replays the
/// session exactly, upcoming random choices included.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SessionState {
    user: String,
    seed: u64,
    rng: Xoshiro256PlusPlus,
    conditions: Vec<Condition>,
    staircases: Vec<Staircase>,
    bag: ReferenceBag,
    recorder: TrialRecorder,
    phase: Phase,
    /// Index of the active condition; overwritten on every switch.
    active: usize,
    /// Recent selections, oldest first.
    history: VecDeque<usize>,
    is_reference: bool,
    ghost: Option<Staircase>,
    needs_switch: bool,
    global_trials: u64,
}

/// A proposed trial, ready for presentation.
#[derive(Debug, Clone, PartialEq)]
pub struct NextTrial {
    /// The active condition's parameters (catch trials reuse them; the
    /// renderer decides what "no artifact" looks like).
    pub condition: Condition,
    /// Stimulus intensity to present.
    pub intensity: f64,
    /// Whether this is a catch trial.
    pub is_reference: bool,
    /// Whether the scheduler switched conditions for this trial.
    pub condition_changed: bool,
}

/// Session progress for the experimenter's display.
#[derive(Debug, Clone, PartialEq)]
pub struct Progress {
    /// Accepted real responses across all conditions.
    pub done: usize,
    /// Sum of all trial budgets.
    pub total: usize,
    /// `done / total`, as a percentage.
    pub percent: f64,
    /// Wall time since construction (or resume).
    pub elapsed: Duration,
    /// Mean time per accepted response in this run, once there is one.
    pub average_trial: Option<Duration>,
    /// `average_trial` extrapolated over the remaining budget.
    pub estimated_remaining: Option<Duration>,
}

/// Adaptive multi-condition trial scheduler.
#[derive(Debug)]
pub struct QuestScheduler {
    state: SessionState,
    store: PersistenceStore,
    started: Instant,
    done_at_start: usize,
}

impl QuestScheduler {
    /// Build a session over the given conditions.
    ///
    /// When the data directory already holds snapshots, the session resumes
    /// from the latest one and the supplied conditions are superseded by the
    /// recorded ones.
    pub fn new(config: SchedulerConfig, conditions: Vec<Condition>) -> QuestResult<Self> {
        if conditions.is_empty() {
            return Err(QuestError::invalid_state(
                "at least one condition is required",
            ));
        }
        for (i, c) in conditions.iter().enumerate() {
            c.validate().map_err(|message| {
                QuestError::invalid_state(format!("condition '{}': {}", c.label, message))
            })?;
            if conditions[..i].iter().any(|prev| prev.label == c.label) {
                return Err(QuestError::invalid_state(format!(
                    "duplicate condition label '{}'",
                    c.label
                )));
            }
        }

        let seed = config.seed.unwrap_or_else(|| rand::rng().random());
        let staircases = conditions.iter().map(Staircase::new).collect();
        // Registering every label up front makes the CSV group conditions in
        // construction order, not in whatever order they get scheduled.
        let mut recorder = TrialRecorder::new();
        for condition in &conditions {
            recorder.register(&condition.label);
        }
        let mut state = SessionState {
            user: config.user,
            seed,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
            conditions,
            staircases,
            bag: ReferenceBag::new(config.reference_bag_size, config.reference_probability),
            recorder,
            phase: Phase::Selecting,
            active: 0,
            history: VecDeque::new(),
            is_reference: false,
            ghost: None,
            needs_switch: true,
            global_trials: 0,
        };

        let mut store = PersistenceStore::open(&config.data_dir)?;
        if store.restore(&mut state, 0)? {
            info!(
                "resumed session for '{}' from snapshot {} ({} trials recorded)",
                state.user,
                store.count(),
                state.global_trials
            );
        } else {
            info!("new session for '{}' with seed {}", state.user, seed);
        }

        let done_at_start = state.staircases.iter().map(|s| s.responses().len()).sum();
        Ok(Self {
            state,
            store,
            started: Instant::now(),
            done_at_start,
        })
    }

    /// Propose the next trial.
    ///
    /// The active condition keeps re-proposing until a response forces a
    /// switch; a switch picks uniformly among unfinished conditions while
    /// avoiding the most recent ones, then asks the catch-trial bag whether
    /// this trial runs against a ghost copy instead of the real staircase.
    ///
    /// Errors with [`QuestError::Exhausted`] once every condition is done
    /// (terminal) and [`QuestError::InvalidState`] when a trial is already
    /// awaiting its response.
    pub fn next_trial(&mut self) -> QuestResult<NextTrial> {
        match self.state.phase {
            Phase::Finished => return Err(QuestError::Exhausted),
            Phase::AwaitingResponse => {
                return Err(QuestError::invalid_state(
                    "next_trial() while a trial is awaiting its response",
                ))
            }
            Phase::Selecting => {}
        }

        let changed = if self.state.needs_switch {
            match self.select_condition() {
                Some(index) => {
                    self.state.active = index;
                    self.state.is_reference = self
                        .state
                        .bag
                        .next_is_reference(&mut self.state.rng);
                    self.state.ghost = if self.state.is_reference {
                        Some(self.state.staircases[index].clone())
                    } else {
                        None
                    };
                    true
                }
                None => {
                    self.state.phase = Phase::Finished;
                    info!(
                        "session finished after {} trials",
                        self.state.global_trials
                    );
                    return Err(QuestError::Exhausted);
                }
            }
        } else {
            // Same condition continues as a real trial; a ghost restored
            // from a snapshot is stale here.
            self.state.is_reference = false;
            self.state.ghost = None;
            false
        };

        let intensity = match self.state.ghost.as_mut() {
            Some(ghost) => ghost.next_intensity()?,
            None => self.state.staircases[self.state.active].next_intensity()?,
        };
        self.state.phase = Phase::AwaitingResponse;

        let condition = self.state.conditions[self.state.active].clone();
        debug!(
            "trial {}: condition '{}' at intensity {:.4}{}{}",
            self.state.global_trials,
            condition.label,
            intensity,
            if self.state.is_reference {
                " (catch)"
            } else {
                ""
            },
            if changed { " (switched)" } else { "" },
        );
        Ok(NextTrial {
            condition,
            intensity,
            is_reference: self.state.is_reference,
            condition_changed: changed,
        })
    }

    /// Record the subject's response to the outstanding trial.
    ///
    /// Scores the response (a catch trial is correct when the artifact was
    /// *not* reported), appends the trial row, feeds the ghost or the real
    /// staircase, decides whether the next trial must switch conditions, and
    /// snapshots the whole session.
    pub fn record_response(&mut self, response: TrialResponse) -> QuestResult<()> {
        if self.state.phase != Phase::AwaitingResponse {
            return Err(QuestError::invalid_state(
                "record_response() with no trial awaiting a response",
            ));
        }

        let is_reference = self.state.is_reference;
        let correct = if is_reference {
            !response.saw_artifact
        } else {
            response.saw_artifact
        };
        let intensity_change = if is_reference {
            IntensityChange::None
        } else if response.saw_artifact {
            IntensityChange::Increase
        } else {
            IntensityChange::Decrease
        };

        let active = self.state.active;
        let label = self.state.conditions[active].label.clone();
        let intensity = match self.state.ghost.as_ref() {
            Some(ghost) => ghost.pending_intensity(),
            None => self.state.staircases[active].pending_intensity(),
        }
        .ok_or_else(|| QuestError::invalid_state("no proposal outstanding"))?;

        let record = TrialRecord {
            user: self.state.user.clone(),
            global_trial_id: self.state.global_trials,
            condition_trial_id: self.state.recorder.rows(&label),
            intensity,
            intensity_change,
            selection: response.selection,
            correct,
            position: response.position,
            is_reference,
            duration: response.duration,
        };
        self.state.recorder.record_trial(&label, &record);
        self.record_condition_parameters(active, &label);

        let fed = match self.state.ghost.as_mut() {
            Some(ghost) => ghost.add_response(correct),
            None => self.state.staircases[active].add_response(correct),
        };
        match fed {
            Ok(()) => {}
            Err(collapse @ QuestError::NumericalCollapse { .. }) => {
                // The staircase already reseeded itself; the session goes on.
                warn!("{}", collapse);
            }
            Err(other) => return Err(other),
        }

        self.state.global_trials += 1;
        self.state.needs_switch =
            response.saw_artifact || self.state.staircases[active].finished();
        self.state.phase = Phase::Selecting;

        self.store.snapshot(&self.state)?;
        // The ghost dies with its response recorded; the snapshot above is
        // the one place it outlives this call.
        self.state.ghost = None;
        Ok(())
    }

    /// Rewind to the state before the most recent response and its trial.
    ///
    /// No-op returning `Ok(false)` when fewer than two snapshots exist.
    /// After a successful undo, `next_trial()` re-presents the undone trial
    /// exactly: condition, intensity, and catch flag all replay.
    pub fn undo(&mut self) -> QuestResult<bool> {
        if self.store.count() < 2 {
            return Ok(false);
        }
        let restored = self.store.restore(&mut self.state, 1)?;
        if restored {
            info!("undo: rewound to snapshot {}", self.store.count());
        }
        Ok(restored)
    }

    /// Export all recorded trials as CSV, draining the recorder.
    ///
    /// An existing file at `path` is renamed aside first; a final save can
    /// never clobber earlier data.
    pub fn export_csv(&mut self, path: impl AsRef<Path>) -> QuestResult<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        move_aside(path)?;
        let mut writer = io::BufWriter::new(fs::File::create(path)?);
        self.state.recorder.export_to(&mut writer)?;
        info!("exported session CSV to {:?}", path);
        Ok(())
    }

    /// Export all recorded trials as CSV into an arbitrary writer.
    pub fn export_to<W: io::Write>(&mut self, writer: &mut W) -> QuestResult<()> {
        self.state.recorder.export_to(writer)?;
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// True once every condition has spent its trial budget.
    pub fn finished(&self) -> bool {
        self.state.phase == Phase::Finished
            || self.state.staircases.iter().all(Staircase::finished)
    }

    /// The conditions this session runs, in construction order.
    pub fn conditions(&self) -> &[Condition] {
        &self.state.conditions
    }

    /// The staircase estimating a condition's threshold.
    pub fn staircase(&self, label: &str) -> Option<&Staircase> {
        self.state.staircases.iter().find(|s| s.label() == label)
    }

    /// Trials recorded so far, catch trials included.
    pub fn global_trials(&self) -> u64 {
        self.state.global_trials
    }

    /// Snapshots written for this session so far.
    pub fn snapshot_count(&self) -> u32 {
        self.store.count()
    }

    /// Subject identifier.
    pub fn user(&self) -> &str {
        &self.state.user
    }

    /// The effective RNG seed (useful for reproducing an unseeded session).
    pub fn seed(&self) -> u64 {
        self.state.seed
    }

    /// Session progress for the experimenter's display.
    pub fn progress(&self) -> Progress {
        let done: usize = self
            .state
            .staircases
            .iter()
            .map(|s| s.responses().len())
            .sum();
        let total: usize = self
            .state
            .conditions
            .iter()
            .map(|c| c.trial_budget)
            .sum();
        let elapsed = self.started.elapsed();
        let done_this_run = done.saturating_sub(self.done_at_start);
        let average_trial = if done_this_run > 0 {
            Some(elapsed / done_this_run as u32)
        } else {
            None
        };
        let estimated_remaining = average_trial.map(|avg| avg * (total - done) as u32);
        Progress {
            done,
            total,
            percent: 100.0 * done as f64 / total as f64,
            elapsed,
            average_trial,
            estimated_remaining,
        }
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Pick the next condition uniformly among unfinished ones, avoiding the
    /// last `max(1, remaining/3)` selections. The exclusion is skipped when
    /// fewer than two conditions remain (it could otherwise empty the pool).
    fn select_condition(&mut self) -> Option<usize> {
        let remaining: Vec<usize> = (0..self.state.staircases.len())
            .filter(|&i| !self.state.staircases[i].finished())
            .collect();
        if remaining.is_empty() {
            return None;
        }

        let candidates: Vec<usize> = if remaining.len() < 2 {
            remaining
        } else {
            let k = (remaining.len() / 3).max(1);
            let recent: Vec<usize> = self
                .state
                .history
                .iter()
                .rev()
                .take(k)
                .copied()
                .collect();
            remaining
                .into_iter()
                .filter(|i| !recent.contains(i))
                .collect()
        };

        let choice = candidates[self.state.rng.random_range(0..candidates.len())];
        self.push_history(choice);
        Some(choice)
    }

    fn push_history(&mut self, index: usize) {
        let capacity = (self.state.staircases.len() / 3).max(1);
        self.state.history.push_back(index);
        while self.state.history.len() > capacity {
            self.state.history.pop_front();
        }
    }

    /// Repeat the active condition's parameters on the trial row, so every
    /// exported row is self-describing.
    fn record_condition_parameters(&mut self, active: usize, label: &str) {
        let condition = &self.state.conditions[active];
        let recorder = &mut self.state.recorder;
        recorder.record(label, "prior_threshold", condition.prior_threshold);
        recorder.record(label, "prior_sd", condition.prior_sd);
        recorder.record(label, "slope", condition.slope);
        recorder.record(label, "guess_rate", condition.guess_rate);
        recorder.record(label, "lapse_rate", condition.lapse_rate);
        recorder.record(label, "grain", condition.grain);
        recorder.record(label, "trial_budget", condition.trial_budget);
        for (key, value) in &condition.extra {
            recorder.record(label, key, render_value(value));
        }
    }
}

/// CSV rendering for opaque parameters: strings unquoted, everything else in
/// its JSON form.
fn render_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}
