//! Recording actions and scripted probes.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::core::ProbeResult;
use crate::errors::ActionError;
use crate::stages::{Action, Probe};

/// Shared, ordered log of invoked action labels.
///
/// Clones share the same log, so one journal can be handed to several
/// actions to observe the order they ran in.
#[derive(Debug, Clone, Default)]
pub struct Journal {
    entries: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Appends an entry.
    pub fn push(&self, entry: impl Into<String>) {
        self.entries.lock().push(entry.into());
    }

    /// Returns a copy of all entries.
    #[must_use]
    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().clone()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

/// An action that counts its invocations and returns a fixed result.
///
/// Clones share the counter, so a test can keep one handle and pass the
/// other into a stage via [`RecordingAction::into_action`].
#[derive(Debug, Clone)]
pub struct RecordingAction {
    label: String,
    succeed: bool,
    calls: Arc<AtomicUsize>,
    journal: Option<Journal>,
}

impl RecordingAction {
    /// Creates an action that always succeeds.
    #[must_use]
    pub fn succeeding(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            succeed: true,
            calls: Arc::new(AtomicUsize::new(0)),
            journal: None,
        }
    }

    /// Creates an action that always fails with `"<label> failed"`.
    #[must_use]
    pub fn failing(label: impl Into<String>) -> Self {
        Self {
            succeed: false,
            ..Self::succeeding(label)
        }
    }

    /// Records each invocation in `journal`.
    #[must_use]
    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    /// Returns the number of invocations so far.
    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Wraps the action for use in a stage or chain.
    #[must_use]
    pub fn into_action(self) -> Arc<dyn Action> {
        Arc::new(self)
    }
}

#[async_trait]
impl Action for RecordingAction {
    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self) -> Result<(), ActionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(journal) = &self.journal {
            journal.push(&self.label);
        }
        if self.succeed {
            Ok(())
        } else {
            Err(ActionError::Other(format!("{} failed", self.label)))
        }
    }
}

/// A probe that replays a script of results.
///
/// Each check pops the next scripted result; once the script runs dry the
/// last result repeats.
#[derive(Debug, Clone)]
pub struct ScriptedProbe {
    script: Arc<Mutex<VecDeque<ProbeResult>>>,
    last: Arc<Mutex<ProbeResult>>,
    checks: Arc<AtomicUsize>,
}

impl ScriptedProbe {
    /// Creates a probe returning `results` in order.
    #[must_use]
    pub fn new(results: impl IntoIterator<Item = ProbeResult>) -> Self {
        Self {
            script: Arc::new(Mutex::new(results.into_iter().collect())),
            last: Arc::new(Mutex::new(ProbeResult::NotSatisfied)),
            checks: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// A probe that always reports the end state holds.
    #[must_use]
    pub fn satisfied() -> Self {
        Self::new([ProbeResult::Satisfied])
    }

    /// A probe that always reports work to do.
    #[must_use]
    pub fn not_satisfied() -> Self {
        Self::new([ProbeResult::NotSatisfied])
    }

    /// A probe that cannot decide.
    #[must_use]
    pub fn indeterminate(reason: impl Into<String>) -> Self {
        Self::new([ProbeResult::Indeterminate(reason.into())])
    }

    /// Returns the number of checks so far.
    #[must_use]
    pub fn checks(&self) -> usize {
        self.checks.load(Ordering::SeqCst)
    }

    /// Wraps the probe for use in a stage.
    #[must_use]
    pub fn into_probe(self) -> Arc<dyn Probe> {
        Arc::new(self)
    }
}

#[async_trait]
impl Probe for ScriptedProbe {
    async fn check(&self) -> ProbeResult {
        self.checks.fetch_add(1, Ordering::SeqCst);
        let mut last = self.last.lock();
        if let Some(next) = self.script.lock().pop_front() {
            *last = next;
        }
        last.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_recording_action_shares_counter() {
        let action = RecordingAction::failing("mirror");
        let handle = action.clone().into_action();

        let err = handle.run().await.unwrap_err();
        assert_eq!(err.to_string(), "mirror failed");
        assert_eq!(action.calls(), 1);
    }

    #[tokio::test]
    async fn test_scripted_probe_repeats_last() {
        let probe = ScriptedProbe::new([ProbeResult::NotSatisfied, ProbeResult::Satisfied]);
        assert_eq!(probe.check().await, ProbeResult::NotSatisfied);
        assert_eq!(probe.check().await, ProbeResult::Satisfied);
        assert_eq!(probe.check().await, ProbeResult::Satisfied);
        assert_eq!(probe.checks(), 3);
    }
}
