//! Assertions over run results.

use crate::core::StageOutcome;
use crate::report::RunResult;

/// Asserts that `stage` was recorded with `expected`.
pub fn assert_outcome(result: &RunResult, stage: &str, expected: StageOutcome) {
    let actual = result.outcome_of(stage);
    assert_eq!(
        actual,
        Some(expected),
        "Expected stage '{stage}' to be {expected:?}, got {actual:?}"
    );
}

/// Asserts that `stage` never ran.
pub fn assert_not_run(result: &RunResult, stage: &str) {
    assert!(
        result.outcome_of(stage).is_none(),
        "Expected stage '{stage}' not to run, got {:?}",
        result.outcome_of(stage)
    );
}

/// Asserts that every recorded stage was skipped.
pub fn assert_all_skipped(result: &RunResult) {
    let ran: Vec<_> = result
        .outcomes()
        .filter(|(_, outcome)| *outcome != StageOutcome::Skipped)
        .collect();
    assert!(ran.is_empty(), "Expected all stages skipped, these ran: {ran:?}");
}

/// Asserts that the run completed without a fatal failure.
pub fn assert_completed(result: &RunResult) {
    assert!(
        !result.aborted,
        "Expected run to complete, aborted at {:?}",
        result.abort_stage
    );
}

/// Asserts that the run aborted at `stage`.
pub fn assert_aborted_at(result: &RunResult, stage: &str) {
    assert!(result.aborted, "Expected run to abort at '{stage}'");
    assert_eq!(result.abort_stage.as_deref(), Some(stage));
}
