/// Failure of a single health check to execute. Distinct from the
/// deployment being unhealthy: the affected check reports `Unknown` and the
/// rest of the battery still runs.
#[derive(Debug, thiserror::Error)]
pub enum HealthCheckError {
    #[error("{check} did not finish within {timeout_ms}ms")]
    Timeout { check: String, timeout_ms: u64 },

    #[error("checker {program} could not be started: {source}")]
    CheckerUnavailable {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid log marker pattern: {0}")]
    InvalidPattern(#[from] regex::Error),

    #[error("remediation failed: {0}")]
    Remediation(String),

    #[error("history serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
