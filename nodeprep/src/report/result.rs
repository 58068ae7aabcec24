//! Recorded outcome of one pipeline invocation.

use crate::core::StageOutcome;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Outcome of one stage, with the detail needed to explain it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageRecord {
    /// Stage name.
    pub name: String,
    /// Final outcome.
    pub outcome: StageOutcome,
    /// Label of the fallback candidate that succeeded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub via: Option<String>,
    /// Last error message, for failed stages.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Wall time spent in the stage.
    pub duration_ms: f64,
}

impl StageRecord {
    /// Creates a record with no detail.
    #[must_use]
    pub fn new(name: impl Into<String>, outcome: StageOutcome) -> Self {
        Self {
            name: name.into(),
            outcome,
            via: None,
            error: None,
            duration_ms: 0.0,
        }
    }

    /// Sets the chosen fallback label.
    #[must_use]
    pub fn with_via(mut self, label: impl Into<String>) -> Self {
        self.via = Some(label.into());
        self
    }

    /// Sets the error message.
    #[must_use]
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    /// Sets the duration.
    #[must_use]
    pub fn with_duration_ms(mut self, duration_ms: f64) -> Self {
        self.duration_ms = duration_ms;
        self
    }
}

/// Outcome of a whole pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunResult {
    /// Unique ID of this run.
    pub run_id: Uuid,
    /// Pipeline name.
    pub pipeline: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run finished.
    pub finished_at: DateTime<Utc>,
    /// Per-stage records, in execution order.
    pub stages: Vec<StageRecord>,
    /// Whether a fatal stage aborted the run.
    pub aborted: bool,
    /// The stage that aborted the run.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub abort_stage: Option<String>,
}

impl RunResult {
    /// Starts an empty result for `pipeline`.
    #[must_use]
    pub fn start(pipeline: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::new_v4(),
            pipeline: pipeline.into(),
            started_at: now,
            finished_at: now,
            stages: Vec::new(),
            aborted: false,
            abort_stage: None,
        }
    }

    /// Appends a stage record; a fatal outcome marks the run aborted.
    pub fn record(&mut self, record: StageRecord) {
        if record.outcome == StageOutcome::FailedFatal {
            self.aborted = true;
            self.abort_stage = Some(record.name.clone());
        }
        self.stages.push(record);
    }

    /// Marks the run finished.
    pub fn finish(&mut self) {
        self.finished_at = Utc::now();
    }

    /// Iterates `(stage name, outcome)` pairs in execution order.
    pub fn outcomes(&self) -> impl Iterator<Item = (&str, StageOutcome)> + '_ {
        self.stages.iter().map(|r| (r.name.as_str(), r.outcome))
    }

    /// Returns the outcome recorded for `stage`.
    #[must_use]
    pub fn outcome_of(&self, stage: &str) -> Option<StageOutcome> {
        self.stages
            .iter()
            .find(|r| r.name == stage)
            .map(|r| r.outcome)
    }

    /// Returns the record for `stage`.
    #[must_use]
    pub fn record_of(&self, stage: &str) -> Option<&StageRecord> {
        self.stages.iter().find(|r| r.name == stage)
    }

    /// Total duration of the run in milliseconds.
    #[must_use]
    pub fn duration_ms(&self) -> f64 {
        #[allow(clippy::cast_precision_loss)]
        let ms = (self.finished_at - self.started_at).num_milliseconds() as f64;
        ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fatal_marks_aborted() {
        let mut result = RunResult::start("install");
        result.record(StageRecord::new("a", StageOutcome::Success));
        assert!(!result.aborted);

        result.record(StageRecord::new("b", StageOutcome::FailedFatal).with_error("boom"));
        assert!(result.aborted);
        assert_eq!(result.abort_stage.as_deref(), Some("b"));
    }

    #[test]
    fn test_outcomes_in_order() {
        let mut result = RunResult::start("install");
        result.record(StageRecord::new("a", StageOutcome::Skipped));
        result.record(StageRecord::new("b", StageOutcome::FailedNonFatal));

        let outcomes: Vec<_> = result.outcomes().collect();
        assert_eq!(
            outcomes,
            vec![("a", StageOutcome::Skipped), ("b", StageOutcome::FailedNonFatal)]
        );
        assert_eq!(result.outcome_of("b"), Some(StageOutcome::FailedNonFatal));
        assert_eq!(result.outcome_of("c"), None);
    }

    #[test]
    fn test_run_result_serialization() {
        let mut result = RunResult::start("cleanup");
        result.record(
            StageRecord::new("a", StageOutcome::SuccessViaFallback(1)).with_via("mirror-b"),
        );
        result.finish();

        let json = serde_json::to_string(&result).unwrap();
        let back: RunResult = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, result.run_id);
        assert_eq!(back.stages, result.stages);
        assert!(!json.contains("abort_stage"));
    }
}
