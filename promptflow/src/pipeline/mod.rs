//! Pipeline sequencing and run state.
//!
//! This module provides:
//! - Stage/run statuses and records
//! - Run-level cancellation
//! - The orchestrator that drives stages to completion

mod orchestrator;
mod run;

#[cfg(test)]
mod integration_tests;

pub use orchestrator::PipelineOrchestrator;
pub use run::{CancelToken, PipelineRun, RunResult, RunStatus, StageRecord, StageStatus};
