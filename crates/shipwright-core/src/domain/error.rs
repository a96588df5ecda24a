//! Crate-level error taxonomy.
//!
//! Each subsystem owns a focused error enum; [`ShipwrightError`] wraps them
//! for callers that drive several subsystems at once (the orchestrator and
//! the CLI).

use crate::cas::CasError;
use crate::deploy::DeployError;
use crate::generator::GenerationError;
use crate::health::HealthCheckError;
use crate::sandbox::SandboxError;

/// Umbrella error for shipwright operations.
#[derive(Debug, thiserror::Error)]
pub enum ShipwrightError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("generation error: {0}")]
    Generation(#[from] GenerationError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("deployment error: {0}")]
    Deploy(#[from] DeployError),

    #[error("health check error: {0}")]
    HealthCheck(#[from] HealthCheckError),

    #[error("artifact store error: {0}")]
    Cas(#[from] CasError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for shipwright operations.
pub type Result<T> = std::result::Result<T, ShipwrightError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_language_display() {
        let err = ShipwrightError::UnsupportedLanguage("cobol".to_string());
        assert_eq!(err.to_string(), "unsupported language: cobol");
    }

    #[test]
    fn test_deploy_error_wraps_verbatim() {
        let err: ShipwrightError = DeployError::NoPriorVersion {
            name: "svc".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.starts_with("deployment error:"));
        assert!(msg.contains("svc"));
    }
}
