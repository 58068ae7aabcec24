//! Severity, probe and outcome enums.

use serde::{Deserialize, Serialize};
use std::fmt;

/// How a stage's total failure affects the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Exhausting the stage aborts the pipeline.
    #[default]
    Fatal,
    /// Exhausting the stage is recorded and the pipeline continues.
    Warn,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fatal => write!(f, "fatal"),
            Self::Warn => write!(f, "warn"),
        }
    }
}

/// Result of an idempotency probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "state", content = "reason")]
pub enum ProbeResult {
    /// The desired end state already holds.
    Satisfied,
    /// The stage has work to do.
    NotSatisfied,
    /// The probe could not decide; the stage runs as if not satisfied.
    Indeterminate(String),
}

impl ProbeResult {
    /// Returns true if the stage can be skipped.
    #[must_use]
    pub fn is_satisfied(&self) -> bool {
        matches!(self, Self::Satisfied)
    }

    /// Maps a boolean state check onto a probe result.
    #[must_use]
    pub fn from_bool(satisfied: bool) -> Self {
        if satisfied {
            Self::Satisfied
        } else {
            Self::NotSatisfied
        }
    }
}

impl fmt::Display for ProbeResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Satisfied => write!(f, "satisfied"),
            Self::NotSatisfied => write!(f, "not satisfied"),
            Self::Indeterminate(reason) => write!(f, "indeterminate ({reason})"),
        }
    }
}

/// Final outcome of a single stage within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome", content = "candidate")]
pub enum StageOutcome {
    /// The probe reported the end state already holds.
    Skipped,
    /// The primary action succeeded.
    Success,
    /// The primary action failed and the fallback at this index succeeded.
    SuccessViaFallback(usize),
    /// A WARN stage exhausted its actions.
    FailedNonFatal,
    /// A FATAL stage exhausted its actions; the pipeline aborted here.
    FailedFatal,
}

impl StageOutcome {
    /// Returns true if the stage's end state holds after the run.
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(
            self,
            Self::Skipped | Self::Success | Self::SuccessViaFallback(_)
        )
    }

    /// Returns true if the stage failed, fatally or not.
    #[must_use]
    pub fn is_failure(&self) -> bool {
        matches!(self, Self::FailedNonFatal | Self::FailedFatal)
    }

    /// Returns true if dependents of this stage may still run.
    #[must_use]
    pub fn unblocks_dependents(&self) -> bool {
        !matches!(self, Self::FailedFatal)
    }

    /// Returns the fallback index that produced the outcome, if any.
    #[must_use]
    pub fn fallback_index(&self) -> Option<usize> {
        match self {
            Self::SuccessViaFallback(index) => Some(*index),
            _ => None,
        }
    }
}

impl fmt::Display for StageOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Skipped => write!(f, "skipped"),
            Self::Success => write!(f, "success"),
            Self::SuccessViaFallback(index) => write!(f, "success via fallback #{index}"),
            Self::FailedNonFatal => write!(f, "failed (non-fatal)"),
            Self::FailedFatal => write!(f, "failed (fatal)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_default_is_fatal() {
        assert_eq!(Severity::default(), Severity::Fatal);
        assert_eq!(Severity::Warn.to_string(), "warn");
    }

    #[test]
    fn test_probe_result_from_bool() {
        assert!(ProbeResult::from_bool(true).is_satisfied());
        assert!(!ProbeResult::from_bool(false).is_satisfied());
        assert!(!ProbeResult::Indeterminate("no access".into()).is_satisfied());
    }

    #[test]
    fn test_outcome_classification() {
        assert!(StageOutcome::Skipped.is_success());
        assert!(StageOutcome::SuccessViaFallback(2).is_success());
        assert!(StageOutcome::FailedNonFatal.is_failure());
        assert!(StageOutcome::FailedNonFatal.unblocks_dependents());
        assert!(!StageOutcome::FailedFatal.unblocks_dependents());
        assert_eq!(StageOutcome::SuccessViaFallback(1).fallback_index(), Some(1));
        assert_eq!(StageOutcome::Success.fallback_index(), None);
    }

    #[test]
    fn test_outcome_display() {
        assert_eq!(StageOutcome::Skipped.to_string(), "skipped");
        assert_eq!(
            StageOutcome::SuccessViaFallback(0).to_string(),
            "success via fallback #0"
        );
        assert_eq!(StageOutcome::FailedFatal.to_string(), "failed (fatal)");
    }

    #[test]
    fn test_outcome_serialize() {
        let json = serde_json::to_string(&StageOutcome::SuccessViaFallback(2)).unwrap();
        assert_eq!(json, r#"{"outcome":"success_via_fallback","candidate":2}"#);

        let json = serde_json::to_string(&StageOutcome::Skipped).unwrap();
        assert_eq!(json, r#"{"outcome":"skipped"}"#);
    }
}
