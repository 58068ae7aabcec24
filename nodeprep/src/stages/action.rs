//! Action and probe traits with closure-backed implementations.

use crate::core::ProbeResult;
use crate::errors::ActionError;
use async_trait::async_trait;
use std::fmt::{self, Debug};
use std::future::Future;
use std::marker::PhantomData;

/// One attempt at bringing the host to a stage's end state.
#[async_trait]
pub trait Action: Send + Sync + Debug {
    /// Short human-readable label, e.g. the mirror or script URL used.
    fn label(&self) -> &str;

    /// Runs the action.
    ///
    /// An action that mutates persisted configuration must converge to the
    /// same state when invoked twice, and must not leave half-applied state
    /// behind when it fails.
    async fn run(&self) -> Result<(), ActionError>;
}

/// Checks whether a stage's end state already holds.
#[async_trait]
pub trait Probe: Send + Sync + Debug {
    /// Evaluates the probe.
    async fn check(&self) -> ProbeResult;
}

/// Probe for stages without persisted state; always reports work to do.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysRun;

#[async_trait]
impl Probe for AlwaysRun {
    async fn check(&self) -> ProbeResult {
        ProbeResult::NotSatisfied
    }
}

/// An action backed by an async closure.
pub struct FnAction<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    label: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnAction<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    /// Creates a new closure-backed action.
    pub fn new(label: impl Into<String>, func: F) -> Self {
        Self {
            label: label.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnAction<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnAction")
            .field("label", &self.label)
            .finish()
    }
}

#[async_trait]
impl<F, Fut> Action for FnAction<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), ActionError>> + Send,
{
    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self) -> Result<(), ActionError> {
        (self.func)().await
    }
}

/// A probe backed by an async closure.
pub struct FnProbe<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    name: String,
    func: F,
    _phantom: PhantomData<fn() -> Fut>,
}

impl<F, Fut> FnProbe<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    /// Creates a new closure-backed probe.
    pub fn new(name: impl Into<String>, func: F) -> Self {
        Self {
            name: name.into(),
            func,
            _phantom: PhantomData,
        }
    }
}

impl<F, Fut> Debug for FnProbe<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnProbe").field("name", &self.name).finish()
    }
}

#[async_trait]
impl<F, Fut> Probe for FnProbe<F, Fut>
where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = ProbeResult> + Send,
{
    async fn check(&self) -> ProbeResult {
        (self.func)().await
    }
}
