//! Pipeline builder with validation.

use super::Pipeline;
use crate::core::Severity;
use crate::errors::{ContractErrorInfo, PipelineValidationError};
use crate::events::{EventSink, LoggingEventSink};
use crate::stages::Stage;
use std::collections::HashSet;
use std::sync::Arc;

/// Builder for creating validated pipelines.
///
/// Stages are kept in insertion order, which is also execution order, so a
/// stage may only depend on stages added before it.
pub struct PipelineBuilder {
    name: String,
    stages: Vec<Stage>,
    names: HashSet<String>,
    default_severity: Severity,
    sink: Arc<dyn EventSink>,
}

impl PipelineBuilder {
    /// Creates a new pipeline builder.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            stages: Vec::new(),
            names: HashSet::new(),
            default_severity: Severity::Fatal,
            sink: Arc::new(LoggingEventSink::default()),
        }
    }

    /// Severity applied to stages added afterwards that did not declare one.
    #[must_use]
    pub fn default_severity(mut self, severity: Severity) -> Self {
        self.default_severity = severity;
        self
    }

    /// Sets the event sink.
    #[must_use]
    pub fn event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Adds a stage to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails (duplicate name, unknown or
    /// later-declared dependency, self dependency).
    pub fn stage(mut self, stage: Stage) -> Result<Self, PipelineValidationError> {
        self.add_stage(stage)?;
        Ok(self)
    }

    /// Adds a stage in place.
    ///
    /// # Errors
    ///
    /// Returns an error if validation fails.
    pub fn add_stage(&mut self, mut stage: Stage) -> Result<(), PipelineValidationError> {
        let name = stage.name().to_string();

        if name.trim().is_empty() {
            return Err(PipelineValidationError::new("Stage name cannot be empty")
                .with_error_info(ContractErrorInfo::new(
                    "PIPELINE-EMPTY-NAME",
                    "Stage names must be non-empty",
                )));
        }

        if self.names.contains(&name) {
            return Err(PipelineValidationError::new(format!(
                "Stage '{name}' is declared twice"
            ))
            .with_stages(vec![name.clone()])
            .with_error_info(
                ContractErrorInfo::new("PIPELINE-DUPLICATE", format!("Duplicate stage '{name}'"))
                    .with_fix_hint("Give each stage a unique name."),
            ));
        }

        for dep in stage.dependencies() {
            if *dep == name {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{name}' cannot depend on itself"
                ))
                .with_stages(vec![name.clone()])
                .with_error_info(ContractErrorInfo::new(
                    "PIPELINE-SELF-DEP",
                    format!("Stage '{name}' lists itself as a dependency"),
                )));
            }

            if !self.names.contains(dep) {
                return Err(PipelineValidationError::new(format!(
                    "Stage '{name}' depends on unknown stage '{dep}'"
                ))
                .with_stages(vec![name.clone(), dep.clone()])
                .with_error_info(
                    ContractErrorInfo::new(
                        "PIPELINE-MISSING-DEP",
                        format!("Dependency '{dep}' not declared before '{name}'"),
                    )
                    .with_context_entry("stage", name.clone())
                    .with_context_entry("dependency", dep.clone())
                    .with_fix_hint(
                        "Add the dependency before the stage that depends on it.",
                    ),
                ));
            }
        }

        stage.default_severity(self.default_severity);
        self.names.insert(name);
        self.stages.push(stage);
        Ok(())
    }

    /// Builds the pipeline.
    ///
    /// # Errors
    ///
    /// Returns an error if the builder has no stages or no name.
    pub fn build(self) -> Result<Pipeline, PipelineValidationError> {
        if self.name.trim().is_empty() {
            return Err(PipelineValidationError::new(
                "Pipeline name cannot be empty or whitespace-only",
            ));
        }

        if self.stages.is_empty() {
            return Err(PipelineValidationError::new("Pipeline has no stages")
                .with_error_info(
                    ContractErrorInfo::new("PIPELINE-EMPTY", "Cannot build an empty pipeline")
                        .with_fix_hint("Add at least one stage to the pipeline before building."),
                ));
        }

        Ok(Pipeline::new(self.name, self.stages, self.sink))
    }

    /// Returns the pipeline name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the number of stages.
    #[must_use]
    pub fn stage_count(&self) -> usize {
        self.stages.len()
    }
}
