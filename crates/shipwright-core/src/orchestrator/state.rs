//! Pipeline states, failure reasons and the outcome record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::cas::Digest;
use crate::deploy::DeploymentRecord;
use crate::health::HealthCheckEntry;
use crate::sandbox::{ExecutionResult, ExecutionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Generating,
    Verifying,
    Refining,
    Deploying,
    Monitoring,
    Succeeded,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Succeeded | PipelineState::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineState::Generating => "generating",
            PipelineState::Verifying => "verifying",
            PipelineState::Refining => "refining",
            PipelineState::Deploying => "deploying",
            PipelineState::Monitoring => "monitoring",
            PipelineState::Succeeded => "succeeded",
            PipelineState::Failed => "failed",
        }
    }
}

impl std::fmt::Display for PipelineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a pipeline ended in `Failed`. Messages from the failing component
/// are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum FailureReason {
    #[error("generation failed: {0}")]
    GenerationFailed(String),

    #[error("execution failed ({status}): {detail}")]
    ExecutionFailed {
        status: ExecutionStatus,
        detail: String,
    },

    #[error("sandbox setup failed: {0}")]
    SandboxSetup(String),

    #[error("deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("deployment unhealthy after deploy: {0}")]
    PostDeployUnhealthy(String),

    #[error("deployment health could not be verified: {0}")]
    PostDeployUnverified(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transition {
    pub from: PipelineState,
    pub to: PipelineState,
    pub at: DateTime<Utc>,
}

/// Sandbox result without the captured streams.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionSummary {
    pub status: ExecutionStatus,
    pub exit_code: i32,
    pub duration_ms: u64,
    pub truncated: bool,
}

impl From<&ExecutionResult> for ExecutionSummary {
    fn from(r: &ExecutionResult) -> Self {
        Self {
            status: r.status,
            exit_code: r.exit_code,
            duration_ms: r.duration_ms,
            truncated: r.truncated,
        }
    }
}

/// One generate-and-verify attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptRecord {
    /// 1-based.
    pub attempt: u32,
    pub content_hash: Option<Digest>,
    pub generation_error: Option<String>,
    pub execution: Option<ExecutionSummary>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineOutcome {
    pub pipeline_id: String,
    pub name: String,
    /// `Succeeded` or `Failed`.
    pub state: PipelineState,
    pub failure: Option<FailureReason>,
    pub attempts: Vec<AttemptRecord>,
    pub transitions: Vec<Transition>,
    pub deployment: Option<DeploymentRecord>,
    pub health: Option<HealthCheckEntry>,
    pub duration_ms: u64,
}

impl PipelineOutcome {
    pub fn is_success(&self) -> bool {
        self.state == PipelineState::Succeeded
    }

    /// States visited, starting with `Generating`.
    pub fn path(&self) -> Vec<PipelineState> {
        let mut path = vec![PipelineState::Generating];
        path.extend(self.transitions.iter().map(|t| t.to));
        path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_reason_wire_format() {
        let reason = FailureReason::ExecutionFailed {
            status: ExecutionStatus::Timeout,
            detail: "deadline".to_string(),
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["reason"], "execution_failed");
        assert_eq!(json["detail"]["status"], "timeout");
        assert_eq!(reason.to_string(), "execution failed (timeout): deadline");
    }

    #[test]
    fn test_terminal_states() {
        assert!(PipelineState::Succeeded.is_terminal());
        assert!(PipelineState::Failed.is_terminal());
        assert!(!PipelineState::Refining.is_terminal());
    }
}
