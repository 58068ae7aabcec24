//! Ordered fallback resolution across alternative sources.
//!
//! A [`MirrorChain`] lists candidate actions for one logical operation, for
//! example "install the cluster runtime" from the upstream script and then
//! from a regional mirror. [`MirrorResolver`] walks the chain left to right
//! and stops at the first candidate that succeeds.

use crate::errors::ActionError;
use crate::stages::Action;
use std::sync::Arc;
use tracing::{debug, info};

/// Ordered candidate actions for a single logical operation.
#[derive(Debug, Clone, Default)]
pub struct MirrorChain {
    candidates: Vec<Arc<dyn Action>>,
}

impl MirrorChain {
    /// Creates an empty chain.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds one candidate per source with `make`, preserving order.
    pub fn from_sources<S, F>(sources: impl IntoIterator<Item = S>, make: F) -> Self
    where
        F: FnMut(S) -> Arc<dyn Action>,
    {
        Self {
            candidates: sources.into_iter().map(make).collect(),
        }
    }

    /// Appends a candidate.
    pub fn push(&mut self, candidate: Arc<dyn Action>) {
        self.candidates.push(candidate);
    }

    /// Appends a candidate, builder style.
    #[must_use]
    pub fn with(mut self, candidate: Arc<dyn Action>) -> Self {
        self.push(candidate);
        self
    }

    /// Returns the number of candidates.
    #[must_use]
    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    /// Returns true if the chain has no candidates.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    /// Returns the candidates in order.
    #[must_use]
    pub fn candidates(&self) -> &[Arc<dyn Action>] {
        &self.candidates
    }

    /// Splits the chain into its first candidate and the rest.
    ///
    /// Stage constructors use this to turn a configured list of sources into
    /// a primary action plus fallbacks.
    #[must_use]
    pub fn split_first(mut self) -> Option<(Arc<dyn Action>, Self)> {
        if self.candidates.is_empty() {
            return None;
        }
        let first = self.candidates.remove(0);
        Some((first, self))
    }
}

impl From<Vec<Arc<dyn Action>>> for MirrorChain {
    fn from(candidates: Vec<Arc<dyn Action>>) -> Self {
        Self { candidates }
    }
}

/// Record of one candidate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptRecord {
    /// Index of the candidate within its chain.
    pub index: usize,
    /// Candidate label.
    pub label: String,
    /// Error message, `None` if the attempt succeeded.
    pub error: Option<String>,
}

/// Outcome of resolving a chain.
#[derive(Debug)]
pub struct Resolution {
    /// Index of the candidate that succeeded.
    pub chosen: Option<usize>,
    /// Every attempt made, in order.
    pub attempts: Vec<AttemptRecord>,
    /// The error of the last failed candidate.
    pub last_error: Option<ActionError>,
}

impl Resolution {
    /// Returns true if some candidate succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.chosen.is_some()
    }

    /// Label of the chosen candidate.
    #[must_use]
    pub fn chosen_label(&self) -> Option<&str> {
        let chosen = self.chosen?;
        self.attempts
            .iter()
            .find(|attempt| attempt.index == chosen)
            .map(|attempt| attempt.label.as_str())
    }

    /// Converts into a plain result carrying the chosen index.
    pub fn into_result(self) -> Result<usize, ActionError> {
        match (self.chosen, self.last_error) {
            (Some(index), _) => Ok(index),
            (None, Some(err)) => Err(err),
            (None, None) => Err(ActionError::Other("no candidates to try".to_string())),
        }
    }
}

/// Tries candidates in order until one succeeds.
#[derive(Debug, Clone, Default)]
pub struct MirrorResolver {
    context: String,
}

impl MirrorResolver {
    /// Creates a resolver; `context` names the operation in log lines.
    #[must_use]
    pub fn new(context: impl Into<String>) -> Self {
        Self {
            context: context.into(),
        }
    }

    /// Resolves the chain.
    ///
    /// Candidates after the first success are never invoked. Failure is
    /// reported only once every candidate has been attempted.
    pub async fn resolve(&self, chain: &MirrorChain) -> Resolution {
        let mut attempts = Vec::with_capacity(chain.len());
        let mut last_error = None;

        for (index, candidate) in chain.candidates().iter().enumerate() {
            debug!(
                operation = %self.context,
                candidate = index,
                source = candidate.label(),
                "Trying candidate"
            );

            match candidate.run().await {
                Ok(()) => {
                    info!(
                        operation = %self.context,
                        candidate = index,
                        source = candidate.label(),
                        "Candidate succeeded"
                    );
                    attempts.push(AttemptRecord {
                        index,
                        label: candidate.label().to_string(),
                        error: None,
                    });
                    return Resolution {
                        chosen: Some(index),
                        attempts,
                        last_error: None,
                    };
                }
                Err(err) => {
                    debug!(
                        operation = %self.context,
                        candidate = index,
                        source = candidate.label(),
                        error = %err,
                        "Candidate failed"
                    );
                    attempts.push(AttemptRecord {
                        index,
                        label: candidate.label().to_string(),
                        error: Some(err.to_string()),
                    });
                    last_error = Some(err);
                }
            }
        }

        Resolution {
            chosen: None,
            attempts,
            last_error,
        }
    }
}
