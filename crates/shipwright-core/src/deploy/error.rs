//! Error types for the deployment manager.

use crate::cas::CasError;
use crate::domain::Language;

/// Errors from deployment operations. An operation that returns one of these
/// has not changed the active version of any name.
#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("cannot delete active version {version} of {name}: no other version can take over")]
    CannotDeleteActive { name: String, version: u64 },

    #[error("no prior version of {name} to roll back to")]
    NoPriorVersion { name: String },

    #[error("{name} has no active version")]
    NoActiveVersion { name: String },

    #[error("deployment not found: {name}{}", .version.map(|v| format!(" v{v}")).unwrap_or_default())]
    NotFound { name: String, version: Option<u64> },

    #[error("invalid deployment name {0:?}")]
    InvalidName(String),

    #[error("artifact language {artifact} does not match requested language {requested}")]
    LanguageMismatch {
        artifact: Language,
        requested: Language,
    },

    #[error("corrupt deployment state for {name}: {detail}")]
    CorruptState { name: String, detail: String },

    #[error("artifact store error: {0}")]
    Cas(#[from] CasError),

    #[error("metadata serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("storage io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for deployment operations.
pub type DeployResult<T> = std::result::Result<T, DeployError>;
