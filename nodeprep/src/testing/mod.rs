//! Testing utilities for provisioning pipelines.
//!
//! This module provides:
//! - Recording actions and scripted probes for engine-level tests
//! - Assertions over run results
//! - A simulated node for running the real stage catalog end to end

mod assertions;
mod fixtures;
mod mocks;

pub use assertions::{
    assert_aborted_at, assert_all_skipped, assert_completed, assert_not_run, assert_outcome,
};
pub use fixtures::{FakeNode, TempNode, FAKE_HOSTNAME, SAMPLE_GPU_CSV};
pub use mocks::{Journal, RecordingAction, ScriptedProbe};
