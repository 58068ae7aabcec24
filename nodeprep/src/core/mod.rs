//! Core domain model types for nodeprep.
//!
//! This module contains the small vocabulary shared by the engine, the
//! stage catalog and the report:
//! - Stage severity
//! - Tri-state idempotency probe results
//! - Per-stage outcomes

mod status;

pub use status::{ProbeResult, Severity, StageOutcome};
