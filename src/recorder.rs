//! In-memory trial log with CSV export.
//!
//! Trials are recorded as per-condition, per-field value queues. Fields are
//! independent queues on purpose: callers may record extra fields for some
//! trials only, and the export pads the short columns with empty cells
//! instead of failing. Export drains the recorder.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::io::Write;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::PersistenceError;
use crate::types::{IntensityChange, Selection};

/// One trial's worth of recorded fields, produced by the scheduler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialRecord {
    /// Subject identifier.
    pub user: String,
    /// Session-wide trial counter, catch trials included.
    pub global_trial_id: u64,
    /// Trials recorded for this condition so far, catch trials included.
    pub condition_trial_id: u64,
    /// Intensity actually presented (the ghost's proposal on catch trials).
    pub intensity: f64,
    /// Direction the staircase moves in response.
    pub intensity_change: IntensityChange,
    /// Which alternative the subject picked.
    pub selection: Selection,
    /// Whether the response was scored correct.
    pub correct: bool,
    /// Pointer position of the pick, when there was one.
    pub position: Option<(f64, f64)>,
    /// Whether this was a catch trial.
    pub is_reference: bool,
    /// Response time.
    pub duration: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ConditionLog {
    label: String,
    /// Rows recorded for this condition; survives export (the queues do not).
    rows: u64,
    fields: BTreeMap<String, VecDeque<String>>,
}

impl ConditionLog {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            rows: 0,
            fields: BTreeMap::new(),
        }
    }

    fn drained(&self) -> bool {
        self.fields.values().all(|q| q.is_empty())
    }
}

/// Append-only trial log, grouped by condition label.
///
/// Values are written to the CSV verbatim, so labels and field values should
/// not contain commas or newlines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrialRecorder {
    conditions: Vec<ConditionLog>,
}

impl TrialRecorder {
    /// An empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the per-condition log for `label` if it does not exist yet.
    ///
    /// The scheduler registers every condition up front, so the export
    /// groups conditions in their construction order no matter which one
    /// happens to be scheduled first.
    pub fn register(&mut self, label: &str) {
        let _ = self.condition_mut(label);
    }

    /// Append one value to a field queue of the labeled condition.
    ///
    /// Unregistered conditions are created on first use and follow the
    /// registered ones in the export. Ragged field lengths are allowed.
    pub fn record(&mut self, label: &str, field: &str, value: impl fmt::Display) {
        let log = self.condition_mut(label);
        log.fields
            .entry(field.to_string())
            .or_default()
            .push_back(value.to_string());
    }

    /// Fan a whole trial out to the field queues and bump the row counter.
    pub fn record_trial(&mut self, label: &str, record: &TrialRecord) {
        let (x, y) = match record.position {
            Some((x, y)) => (format!("{}", x), format!("{}", y)),
            None => (String::new(), String::new()),
        };
        self.record(label, "label", label);
        self.record(label, "user", &record.user);
        self.record(label, "globalTrialId", record.global_trial_id);
        self.record(label, "questTrialId", record.condition_trial_id);
        self.record(label, "intensity", record.intensity);
        self.record(label, "intensityChange", record.intensity_change);
        self.record(label, "selection", record.selection);
        self.record(label, "correct", if record.correct { '1' } else { '0' });
        self.record(label, "x", x);
        self.record(label, "y", y);
        self.record(label, "is_reference", record.is_reference);
        self.record(
            label,
            "duration",
            format!("{:.3}", record.duration.as_secs_f64()),
        );
        self.condition_mut(label).rows += 1;
    }

    /// Rows recorded for a condition, catch trials included. Unlike the
    /// queues this counter is not consumed by export.
    pub fn rows(&self, label: &str) -> u64 {
        self.conditions
            .iter()
            .find(|c| c.label == label)
            .map_or(0, |c| c.rows)
    }

    /// True when nothing is queued for export.
    pub fn is_drained(&self) -> bool {
        self.conditions.iter().all(ConditionLog::drained)
    }

    /// Write the log as CSV and drain every queue.
    ///
    /// The header is the sorted union of every field name seen across all
    /// conditions. Rows are grouped per condition in registration order;
    /// each row pops one value per field, with an empty cell once a field's
    /// queue is drained (or never existed for that condition). Conditions
    /// with no recorded rows contribute nothing.
    pub fn export_to<W: Write>(&mut self, writer: &mut W) -> Result<(), PersistenceError> {
        let header: Vec<String> = self
            .conditions
            .iter()
            .flat_map(|c| c.fields.keys().cloned())
            .collect::<BTreeSet<String>>()
            .into_iter()
            .collect();
        writeln!(writer, "{}", header.join(","))?;

        for log in &mut self.conditions {
            while !log.drained() {
                let row: Vec<String> = header
                    .iter()
                    .map(|field| {
                        log.fields
                            .get_mut(field)
                            .and_then(VecDeque::pop_front)
                            .unwrap_or_default()
                    })
                    .collect();
                writeln!(writer, "{}", row.join(","))?;
            }
        }
        writer.flush()?;
        Ok(())
    }

    fn condition_mut(&mut self, label: &str) -> &mut ConditionLog {
        if let Some(i) = self.conditions.iter().position(|c| c.label == label) {
            return &mut self.conditions[i];
        }
        self.conditions.push(ConditionLog::new(label));
        // just pushed, cannot be empty
        let last = self.conditions.len() - 1;
        &mut self.conditions[last]
    }
}
