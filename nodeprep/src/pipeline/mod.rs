//! Pipeline building and execution.
//!
//! This module provides:
//! - The validating pipeline builder
//! - The sequential, severity-aware execution engine
//! - Mirror chains and their resolver
//! - The bounded verification poller

mod builder;
mod engine;
mod mirror;
mod poll;

pub use builder::PipelineBuilder;
pub use engine::{Pipeline, PlanEntry};
pub use mirror::{AttemptRecord, MirrorChain, MirrorResolver, Resolution};
pub use poll::{PollOutcome, PollPolicy, VerificationPoller};
