//! Pipeline orchestration.
//!
//! Drives each job through `Generating -> Verifying -> (Refining ->
//! Generating)* -> Deploying -> Monitoring -> Succeeded`, failing to
//! `Failed` with a [`FailureReason`] from any non-terminal state.

pub mod pipeline;
pub mod state;

pub use pipeline::{Orchestrator, PipelineConfig, PipelineJob, PipelineRun};
pub use state::{
    AttemptRecord, ExecutionSummary, FailureReason, PipelineOutcome, PipelineState, Transition,
};
