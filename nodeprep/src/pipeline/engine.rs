//! Sequential stage execution.
//!
//! Stages run strictly one after another: a later stage relies on the
//! external side effects of the earlier ones, so there is no parallelism and
//! no preemption of an in-flight action.

use super::{MirrorResolver, Resolution};
use crate::core::{ProbeResult, Severity, StageOutcome};
use crate::errors::ActionError;
use crate::events::EventSink;
use crate::observability::SpanTimer;
use crate::report::{RunResult, StageRecord};
use crate::stages::Stage;
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// An ordered, validated sequence of stages.
///
/// Built by [`super::PipelineBuilder`].
pub struct Pipeline {
    name: String,
    stages: Vec<Stage>,
    sink: Arc<dyn EventSink>,
}

/// One line of a pipeline plan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanEntry {
    /// Stage name.
    pub name: String,
    /// Resolved severity.
    pub severity: Severity,
    /// Declared dependencies.
    pub dependencies: Vec<String>,
    /// Label of the primary action.
    pub primary: String,
    /// Number of fallback candidates.
    pub fallbacks: usize,
}

impl fmt::Display for PlanEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] {}", self.name, self.severity, self.primary)?;
        if self.fallbacks > 0 {
            write!(f, " (+{} fallbacks)", self.fallbacks)?;
        }
        if !self.dependencies.is_empty() {
            write!(f, " after {}", self.dependencies.join(", "))?;
        }
        Ok(())
    }
}

impl Pipeline {
    pub(crate) fn new(name: String, stages: Vec<Stage>, sink: Arc<dyn EventSink>) -> Self {
        Self { name, stages, sink }
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the stages in execution order.
    #[must_use]
    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Describes the stages without running anything.
    #[must_use]
    pub fn plan(&self) -> Vec<PlanEntry> {
        self.stages
            .iter()
            .map(|stage| PlanEntry {
                name: stage.name().to_string(),
                severity: stage.severity(),
                dependencies: stage.dependencies().to_vec(),
                primary: stage.primary().label().to_string(),
                fallbacks: stage.fallbacks().len(),
            })
            .collect()
    }

    /// Runs every stage in order and returns the recorded result.
    ///
    /// The first `FailedFatal` outcome stops the run; no later stage's probe
    /// or action is invoked.
    pub async fn run(&self) -> RunResult {
        let mut result = RunResult::start(&self.name);

        info!(
            pipeline = %self.name,
            run_id = %result.run_id,
            stages = self.stages.len(),
            "Pipeline started"
        );
        self.sink.emit(
            "pipeline.started",
            Some(json!({
                "pipeline": &self.name,
                "run_id": result.run_id.to_string(),
                "stages": self.stages.len(),
            })),
        );

        for stage in &self.stages {
            let record = match unmet_dependency(stage, &result) {
                Some(dep) => self.fail(
                    stage,
                    StageRecord::new(stage.name(), failed_outcome(stage.severity())),
                    &ActionError::precondition(format!("dependency '{dep}' did not complete")),
                ),
                None => self.run_stage(stage).await,
            };

            result.record(record);
            if result.aborted {
                break;
            }
        }

        result.finish();

        if let Some(stage) = &result.abort_stage {
            error!(
                pipeline = %self.name,
                stage = %stage,
                "Pipeline aborted"
            );
            self.sink.emit(
                "pipeline.aborted",
                Some(json!({"pipeline": &self.name, "stage": stage})),
            );
        } else {
            info!(
                pipeline = %self.name,
                duration_ms = result.duration_ms(),
                "Pipeline completed"
            );
            self.sink.emit(
                "pipeline.completed",
                Some(json!({"pipeline": &self.name, "duration_ms": result.duration_ms()})),
            );
        }

        result
    }

    async fn run_stage(&self, stage: &Stage) -> StageRecord {
        let timer = SpanTimer::start(stage.name());
        let name = stage.name();

        match stage.probe().check().await {
            ProbeResult::Satisfied => {
                info!(stage = name, "Already in desired state, skipping");
                self.sink.emit("stage.skipped", Some(json!({"stage": name})));
                return StageRecord::new(name, StageOutcome::Skipped)
                    .with_duration_ms(timer.finish());
            }
            ProbeResult::Indeterminate(reason) => {
                debug!(stage = name, %reason, "Probe indeterminate, running stage");
            }
            ProbeResult::NotSatisfied => {}
        }

        info!(stage = name, source = stage.primary().label(), "Running stage");
        self.sink.emit("stage.started", Some(json!({"stage": name})));

        let primary_error = match stage.primary().run().await {
            Ok(()) => {
                info!(stage = name, status = "success", "Stage completed");
                self.sink.emit(
                    "stage.completed",
                    Some(json!({"stage": name, "duration_ms": timer.elapsed_ms()})),
                );
                return StageRecord::new(name, StageOutcome::Success)
                    .with_duration_ms(timer.finish());
            }
            Err(err) => err,
        };

        if stage.fallbacks().is_empty() {
            let record = StageRecord::new(name, failed_outcome(stage.severity()))
                .with_duration_ms(timer.finish());
            return self.fail(stage, record, &primary_error);
        }

        info!(
            stage = name,
            error = %primary_error,
            fallbacks = stage.fallbacks().len(),
            "Primary action failed, trying fallbacks"
        );

        let Resolution {
            chosen,
            attempts,
            last_error,
        } = MirrorResolver::new(name).resolve(stage.fallbacks()).await;

        if let Some(index) = chosen {
            let via = attempts
                .iter()
                .find(|attempt| attempt.index == index)
                .map_or_else(String::new, |attempt| attempt.label.clone());
            info!(
                stage = name,
                status = "success",
                fallback = index,
                source = %via,
                "Stage completed via fallback"
            );
            self.sink.emit(
                "stage.fallback",
                Some(json!({"stage": name, "candidate": index, "source": &via})),
            );
            return StageRecord::new(name, StageOutcome::SuccessViaFallback(index))
                .with_via(via)
                .with_duration_ms(timer.finish());
        }

        let error = last_error.unwrap_or(primary_error);
        let record = StageRecord::new(name, failed_outcome(stage.severity()))
            .with_duration_ms(timer.finish());
        self.fail(stage, record, &error)
    }

    fn fail(&self, stage: &Stage, record: StageRecord, err: &ActionError) -> StageRecord {
        let name = stage.name();
        match record.outcome {
            StageOutcome::FailedFatal => {
                error!(stage = name, error = %err, "Fatal stage failed");
            }
            _ => {
                warn!(stage = name, error = %err, "Stage failed, continuing");
            }
        }
        self.sink.emit(
            "stage.failed",
            Some(json!({
                "stage": name,
                "severity": stage.severity().to_string(),
                "error": err.to_string(),
            })),
        );
        record.with_error(err.to_string())
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.name)
            .field("stages", &self.stages)
            .finish_non_exhaustive()
    }
}

fn failed_outcome(severity: Severity) -> StageOutcome {
    match severity {
        Severity::Fatal => StageOutcome::FailedFatal,
        Severity::Warn => StageOutcome::FailedNonFatal,
    }
}

fn unmet_dependency<'a>(stage: &'a Stage, result: &RunResult) -> Option<&'a str> {
    stage
        .dependencies()
        .iter()
        .find(|dep| {
            !result
                .outcome_of(dep)
                .is_some_and(|outcome| outcome.unblocks_dependents())
        })
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::pipeline::{MirrorChain, PipelineBuilder};
    use crate::report::ExecutionReport;
    use crate::testing::{Journal, RecordingAction, ScriptedProbe};
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn test_all_success() {
        let pipeline = PipelineBuilder::new("install")
            .stage(Stage::new("a", RecordingAction::succeeding("a").into_action()))
            .unwrap()
            .stage(
                Stage::new("b", RecordingAction::succeeding("b").into_action())
                    .with_dependency("a"),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        assert!(!result.aborted);
        assert_eq!(
            result.outcomes().collect::<Vec<_>>(),
            vec![("a", StageOutcome::Success), ("b", StageOutcome::Success)]
        );
    }

    #[tokio::test]
    async fn test_satisfied_probe_skips_all_actions() {
        let primary = RecordingAction::succeeding("primary");
        let fallback = RecordingAction::succeeding("fallback");
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("a", primary.clone().into_action())
                    .with_probe(ScriptedProbe::satisfied().into_probe())
                    .with_fallback(fallback.clone().into_action()),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        assert_eq!(result.outcome_of("a"), Some(StageOutcome::Skipped));
        assert_eq!(primary.calls(), 0);
        assert_eq!(fallback.calls(), 0);
    }

    #[tokio::test]
    async fn test_indeterminate_probe_runs_stage() {
        let primary = RecordingAction::succeeding("primary");
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("a", primary.clone().into_action())
                    .with_probe(ScriptedProbe::indeterminate("permission denied").into_probe()),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;
        assert_eq!(result.outcome_of("a"), Some(StageOutcome::Success));
        assert_eq!(primary.calls(), 1);
    }

    #[tokio::test]
    async fn test_fallback_index_reported() {
        let chain = MirrorChain::new()
            .with(RecordingAction::failing("m0").into_action())
            .with(RecordingAction::succeeding("m1").into_action());
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("a", RecordingAction::failing("primary").into_action())
                    .with_fallbacks(chain),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        let record = result.record_of("a").unwrap();
        assert_eq!(record.outcome, StageOutcome::SuccessViaFallback(1));
        assert_eq!(record.via.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_fatal_abort_containment() {
        let b_probe = ScriptedProbe::not_satisfied();
        let b_action = RecordingAction::succeeding("b");
        let pipeline = PipelineBuilder::new("install")
            .stage(Stage::new("A", RecordingAction::failing("a").into_action()))
            .unwrap()
            .stage(
                Stage::new("B", b_action.clone().into_action())
                    .with_probe(b_probe.clone().into_probe())
                    .warn(),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        assert!(result.aborted);
        assert_eq!(result.abort_stage.as_deref(), Some("A"));
        assert_eq!(result.outcome_of("A"), Some(StageOutcome::FailedFatal));
        assert_eq!(result.outcome_of("B"), None);
        assert_eq!(b_probe.checks(), 0);
        assert_eq!(b_action.calls(), 0);
        assert_eq!(ExecutionReport::new(&result).exit_code(), 1);
    }

    #[tokio::test]
    async fn test_fatal_after_exhausted_fallbacks() {
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("A", RecordingAction::failing("primary").into_action())
                    .with_fallback(RecordingAction::failing("m0").into_action())
                    .with_fallback(RecordingAction::failing("m1").into_action()),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        let record = result.record_of("A").unwrap();
        assert_eq!(record.outcome, StageOutcome::FailedFatal);
        assert_eq!(record.error.as_deref(), Some("m1 failed"));
    }

    #[tokio::test]
    async fn test_warn_containment() {
        let pipeline = PipelineBuilder::new("install")
            .stage(Stage::new("A", RecordingAction::failing("a").into_action()).warn())
            .unwrap()
            .stage(Stage::new("B", RecordingAction::succeeding("b").into_action()))
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        assert!(!result.aborted);
        assert_eq!(result.outcome_of("A"), Some(StageOutcome::FailedNonFatal));
        assert_eq!(result.outcome_of("B"), Some(StageOutcome::Success));
        assert_eq!(ExecutionReport::new(&result).exit_code(), 0);
    }

    #[tokio::test]
    async fn test_non_adjacent_dependency_of_fatal_never_runs() {
        let journal = Journal::default();
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("x", RecordingAction::succeeding("x").with_journal(journal.clone()).into_action())
                    .warn(),
            )
            .unwrap()
            .stage(Stage::new(
                "y",
                RecordingAction::failing("y").with_journal(journal.clone()).into_action(),
            ))
            .unwrap()
            .stage(
                Stage::new("z", RecordingAction::succeeding("z").into_action()).warn(),
            )
            .unwrap()
            .stage(
                Stage::new(
                    "dependent",
                    RecordingAction::succeeding("dependent")
                        .with_journal(journal.clone())
                        .into_action(),
                )
                .with_dependency("y"),
            )
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;

        assert_eq!(journal.entries(), vec!["x", "y"]);
        assert_eq!(result.outcome_of("dependent"), None);
        assert_eq!(result.outcome_of("z"), None);
    }

    #[tokio::test]
    async fn test_dependency_on_warn_failure_still_runs() {
        let dependent = RecordingAction::succeeding("dependent");
        let pipeline = PipelineBuilder::new("install")
            .stage(Stage::new("a", RecordingAction::failing("a").into_action()).warn())
            .unwrap()
            .stage(Stage::new("b", dependent.clone().into_action()).with_dependency("a"))
            .unwrap()
            .build()
            .unwrap();

        let result = pipeline.run().await;
        assert_eq!(result.outcome_of("b"), Some(StageOutcome::Success));
        assert_eq!(dependent.calls(), 1);
    }

    #[tokio::test]
    async fn test_events_emitted_in_order() {
        let sink = Arc::new(CollectingEventSink::new());
        let pipeline = PipelineBuilder::new("install")
            .event_sink(sink.clone())
            .stage(
                Stage::new("a", RecordingAction::succeeding("a").into_action())
                    .with_probe(ScriptedProbe::satisfied().into_probe()),
            )
            .unwrap()
            .stage(
                Stage::new("b", RecordingAction::failing("b").into_action())
                    .with_fallback(RecordingAction::succeeding("b-mirror").into_action()),
            )
            .unwrap()
            .stage(Stage::new("c", RecordingAction::failing("c").into_action()).warn())
            .unwrap()
            .build()
            .unwrap();

        pipeline.run().await;

        assert_eq!(
            sink.event_types(),
            vec![
                "pipeline.started",
                "stage.skipped",
                "stage.started",
                "stage.fallback",
                "stage.started",
                "stage.failed",
                "pipeline.completed",
            ]
        );
    }

    #[test]
    fn test_plan() {
        let pipeline = PipelineBuilder::new("install")
            .stage(
                Stage::new("a", RecordingAction::succeeding("get.example").into_action())
                    .with_fallback(RecordingAction::succeeding("mirror").into_action()),
            )
            .unwrap()
            .stage(
                Stage::new("b", RecordingAction::succeeding("apply").into_action())
                    .with_dependency("a")
                    .warn(),
            )
            .unwrap()
            .build()
            .unwrap();

        let plan: Vec<String> = pipeline.plan().iter().map(ToString::to_string).collect();
        assert_eq!(
            plan,
            vec![
                "a [fatal] get.example (+1 fallbacks)",
                "b [warn] apply after a",
            ]
        );
    }
}
