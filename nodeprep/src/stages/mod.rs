//! Stage definition: probe, primary action, fallback chain, severity.
//!
//! Stages are the fundamental units of a provisioning pipeline. A stage is
//! pure data plus trait objects; the engine in [`crate::pipeline`] decides
//! when and how its parts are invoked.

mod action;

pub use action::{Action, AlwaysRun, FnAction, FnProbe, Probe};

use crate::core::Severity;
use crate::pipeline::MirrorChain;
use std::fmt;
use std::sync::Arc;

/// A named provisioning step.
#[derive(Clone)]
pub struct Stage {
    name: String,
    dependencies: Vec<String>,
    probe: Arc<dyn Probe>,
    primary: Arc<dyn Action>,
    fallbacks: MirrorChain,
    severity: Option<Severity>,
}

impl Stage {
    /// Creates a stage that always runs its primary action and is fatal on failure.
    pub fn new(name: impl Into<String>, primary: Arc<dyn Action>) -> Self {
        Self {
            name: name.into(),
            dependencies: Vec::new(),
            probe: Arc::new(AlwaysRun),
            primary,
            fallbacks: MirrorChain::default(),
            severity: None,
        }
    }

    /// Sets the idempotency probe.
    #[must_use]
    pub fn with_probe(mut self, probe: Arc<dyn Probe>) -> Self {
        self.probe = probe;
        self
    }

    /// Adds a dependency on an earlier stage.
    #[must_use]
    pub fn with_dependency(mut self, dep: impl Into<String>) -> Self {
        let dep = dep.into();
        if !self.dependencies.contains(&dep) {
            self.dependencies.push(dep);
        }
        self
    }

    /// Appends a fallback candidate.
    #[must_use]
    pub fn with_fallback(mut self, candidate: Arc<dyn Action>) -> Self {
        self.fallbacks.push(candidate);
        self
    }

    /// Replaces the fallback chain.
    #[must_use]
    pub fn with_fallbacks(mut self, chain: MirrorChain) -> Self {
        self.fallbacks = chain;
        self
    }

    /// Declares the stage severity explicitly.
    #[must_use]
    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = Some(severity);
        self
    }

    /// Shorthand for `with_severity(Severity::Warn)`.
    #[must_use]
    pub fn warn(self) -> Self {
        self.with_severity(Severity::Warn)
    }

    /// Applies `severity` unless one was declared explicitly.
    pub(crate) fn default_severity(&mut self, severity: Severity) {
        self.severity.get_or_insert(severity);
    }

    /// Returns the stage name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the declared dependencies, in declaration order.
    #[must_use]
    pub fn dependencies(&self) -> &[String] {
        &self.dependencies
    }

    /// Returns the resolved severity.
    #[must_use]
    pub fn severity(&self) -> Severity {
        self.severity.unwrap_or_default()
    }

    /// Returns the idempotency probe.
    #[must_use]
    pub fn probe(&self) -> &Arc<dyn Probe> {
        &self.probe
    }

    /// Returns the primary action.
    #[must_use]
    pub fn primary(&self) -> &Arc<dyn Action> {
        &self.primary
    }

    /// Returns the fallback chain.
    #[must_use]
    pub fn fallbacks(&self) -> &MirrorChain {
        &self.fallbacks
    }
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stage")
            .field("name", &self.name)
            .field("dependencies", &self.dependencies)
            .field("primary", &self.primary.label())
            .field("fallbacks", &self.fallbacks.len())
            .field("severity", &self.severity())
            .finish_non_exhaustive()
    }
}
