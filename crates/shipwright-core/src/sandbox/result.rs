//! Structured outcome of one sandbox run.

use serde::{Deserialize, Serialize};

/// Terminal classification of a sandbox run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Success,
    Timeout,
    ResourceExceeded,
    RuntimeError,
    SandboxSetupFailure,
}

impl ExecutionStatus {
    /// Statuses caused by the code itself, which refinement can address.
    /// Setup failures are environmental and are not fed back to the
    /// generator.
    pub fn is_code_failure(&self) -> bool {
        matches!(
            self,
            ExecutionStatus::Timeout
                | ExecutionStatus::ResourceExceeded
                | ExecutionStatus::RuntimeError
        )
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::ResourceExceeded => "resource_exceeded",
            ExecutionStatus::RuntimeError => "runtime_error",
            ExecutionStatus::SandboxSetupFailure => "sandbox_setup_failure",
        };
        f.write_str(s)
    }
}

/// Produced exactly once per sandbox run; never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Process exit code; `128 + signal` when killed by a signal, `-1` when
    /// the unit never produced one (timeout, setup failure).
    pub exit_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration_ms: u64,
    pub status: ExecutionStatus,
    /// Set when either stream hit the capture cap.
    pub truncated: bool,
}

impl ExecutionResult {
    /// A run that could not even start.
    pub fn setup_failure(detail: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: detail.into().into_bytes(),
            duration_ms,
            status: ExecutionStatus::SandboxSetupFailure,
            truncated: false,
        }
    }

    /// A run whose deadline passed before the unit could be started.
    pub fn expired(duration_ms: u64) -> Self {
        Self {
            exit_code: -1,
            stdout: Vec::new(),
            stderr: b"deadline expired before execution started".to_vec(),
            duration_ms,
            status: ExecutionStatus::Timeout,
            truncated: false,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ExecutionStatus::Success
    }

    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Last `max_bytes` of stderr as text, cut at a char boundary. Used as
    /// refinement feedback.
    pub fn stderr_tail(&self, max_bytes: usize) -> String {
        let text = self.stderr_lossy();
        if text.len() <= max_bytes {
            return text;
        }
        let mut start = text.len() - max_bytes;
        while !text.is_char_boundary(start) {
            start += 1;
        }
        text[start..].to_string()
    }
}
