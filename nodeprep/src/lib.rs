//! # Nodeprep
//!
//! A staged provisioning orchestrator for GPU cluster nodes.
//!
//! Nodeprep brings a host from a bare distribution install to a working
//! accelerator-enabled cluster node, or tears that state back down:
//!
//! - **Idempotent stages**: every stage probes its end state first and is
//!   skipped when the host already has it
//! - **Mirror fallback**: each stage carries an ordered list of alternative
//!   sources tried until one succeeds
//! - **Severity**: fatal stages abort the run, warn stages are recorded and
//!   the run continues
//! - **Bounded verification**: the end-to-end check polls on a fixed
//!   schedule instead of waiting forever
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use nodeprep::prelude::*;
//!
//! let config = NodeprepConfig::load_or_default(None)?;
//! let caps = Capabilities::system(&config)?;
//! let pipeline = build_pipeline(Mode::implicit(), &config, &caps, Arc::new(LoggingEventSink::default()))?;
//!
//! let result = pipeline.run().await;
//! println!("{}", ExecutionReport::new(&result).render());
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc
)]

pub mod capabilities;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod observability;
pub mod persist;
pub mod pipeline;
pub mod provisioning;
pub mod report;
pub mod stages;
pub mod testing;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::capabilities::{
        Capabilities, ClusterCli, CommandRunner, ContainerRuntime, Fetcher, Host, PackageManager,
    };
    pub use crate::config::NodeprepConfig;
    pub use crate::core::{ProbeResult, Severity, StageOutcome};
    pub use crate::errors::{ActionError, NodeprepError, PipelineValidationError};
    pub use crate::events::{EventSink, LoggingEventSink, NoOpEventSink};
    pub use crate::pipeline::{
        MirrorChain, Pipeline, PipelineBuilder, PollPolicy, VerificationPoller,
    };
    pub use crate::provisioning::{build_pipeline, Mode};
    pub use crate::report::{ExecutionReport, RunResult};
    pub use crate::stages::{Action, AlwaysRun, FnAction, FnProbe, Probe, Stage};
}
