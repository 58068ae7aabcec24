//! Run results and their human-readable rendering.
//!
//! A [`RunResult`] is produced by the engine; an [`ExecutionReport`] turns
//! it into per-stage lines, a summary line and the process exit status.

mod result;

pub use result::{RunResult, StageRecord};

use crate::core::StageOutcome;
use serde::{Deserialize, Serialize};
use std::fmt::Write as _;

/// Exit status for a run that completed without a fatal failure.
pub const EXIT_OK: i32 = 0;
/// Exit status for a run aborted by a fatal stage.
pub const EXIT_ABORTED: i32 = 1;

/// Outcome counts for a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    /// Stages that ran or were skipped.
    pub total: usize,
    /// Stages skipped by their probe.
    pub skipped: usize,
    /// Stages whose primary action succeeded.
    pub succeeded: usize,
    /// Stages rescued by a fallback candidate.
    pub via_fallback: usize,
    /// WARN stages that failed.
    pub warnings: usize,
    /// FATAL stages that failed (zero or one).
    pub fatal: usize,
}

/// Renders a [`RunResult`] for humans and decides the exit status.
#[derive(Debug, Clone)]
pub struct ExecutionReport<'a> {
    result: &'a RunResult,
}

impl<'a> ExecutionReport<'a> {
    /// Creates a report over a run result.
    #[must_use]
    pub fn new(result: &'a RunResult) -> Self {
        Self { result }
    }

    /// Counts outcomes.
    #[must_use]
    pub fn summary(&self) -> Summary {
        let mut summary = Summary::default();
        for (_, outcome) in self.result.outcomes() {
            summary.total += 1;
            match outcome {
                StageOutcome::Skipped => summary.skipped += 1,
                StageOutcome::Success => summary.succeeded += 1,
                StageOutcome::SuccessViaFallback(_) => summary.via_fallback += 1,
                StageOutcome::FailedNonFatal => summary.warnings += 1,
                StageOutcome::FailedFatal => summary.fatal += 1,
            }
        }
        summary
    }

    /// Process exit status: nonzero iff the run aborted.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.result.aborted {
            EXIT_ABORTED
        } else {
            EXIT_OK
        }
    }

    /// One line per stage.
    #[must_use]
    pub fn stage_lines(&self) -> Vec<String> {
        let width = self
            .result
            .stages
            .iter()
            .map(|r| r.name.len())
            .max()
            .unwrap_or(0);

        self.result
            .stages
            .iter()
            .map(|record| {
                let mut line = format!(
                    "[{}] {:width$}  {}",
                    marker(record.outcome),
                    record.name,
                    record.outcome,
                );
                if let Some(via) = &record.via {
                    let _ = write!(line, " ({via})");
                }
                if record.outcome.is_failure() {
                    if let Some(error) = &record.error {
                        let _ = write!(line, ": {error}");
                    }
                }
                line
            })
            .collect()
    }

    /// The final summary line.
    #[must_use]
    pub fn summary_line(&self) -> String {
        let s = self.summary();
        let mut line = format!(
            "{}: {} stages, {} skipped, {} succeeded",
            self.result.pipeline,
            s.total,
            s.skipped,
            s.succeeded + s.via_fallback,
        );
        if s.via_fallback > 0 {
            let _ = write!(line, " ({} via fallback)", s.via_fallback);
        }
        let _ = write!(line, ", {} warnings", s.warnings);
        match &self.result.abort_stage {
            Some(stage) if self.result.aborted => {
                let _ = write!(line, "; aborted at '{stage}'");
            }
            _ => line.push_str("; completed"),
        }
        line
    }

    /// Full rendering: stage lines followed by the summary line.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for line in self.stage_lines() {
            out.push_str(&line);
            out.push('\n');
        }
        out.push_str(&self.summary_line());
        out.push('\n');
        out
    }
}

fn marker(outcome: StageOutcome) -> &'static str {
    match outcome {
        StageOutcome::Skipped => "SKIP",
        StageOutcome::Success | StageOutcome::SuccessViaFallback(_) => " OK ",
        StageOutcome::FailedNonFatal => "WARN",
        StageOutcome::FailedFatal => "FAIL",
    }
}
