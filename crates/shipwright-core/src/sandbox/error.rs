//! Error types for the sandbox module.
//!
//! These never escape [`super::SandboxRunner::run`]; the runner folds them
//! into an `ExecutionResult` with status `SandboxSetupFailure`.

/// Errors produced while setting up or driving an execution unit.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("invalid execution policy: {0}")]
    InvalidPolicy(String),

    #[error("scratch directory setup failed: {0}")]
    Scratch(#[source] std::io::Error),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("container runtime {runtime} could not start the unit (exit {exit_code}): {detail}")]
    ContainerSetup {
        runtime: String,
        exit_code: i32,
        detail: String,
    },

    #[error("no runtime configured for language {0}")]
    NoRuntime(String),

    #[error("io error while supervising unit: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for sandbox operations.
pub type SandboxResult<T> = std::result::Result<T, SandboxError>;
