//! Boundary to the external code generator.
//!
//! Generation itself happens in a remote service; this module defines the
//! request/response contract, the error taxonomy the orchestrator's refine
//! loop depends on, and an HTTP adapter in [`http`].

pub mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Language, SourceArtifact};
use crate::sandbox::ExecutionStatus;

pub use http::{HttpGenerator, HttpGeneratorConfig};

/// Why the previous attempt was rejected, fed back into the next request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureFeedback {
    /// 1-based number of the attempt that failed.
    pub attempt: u32,
    /// Sandbox status, or `None` when the generator call itself failed.
    pub status: Option<ExecutionStatus>,
    pub exit_code: Option<i32>,
    /// Tail of stderr, or the generation error message.
    pub detail: String,
    /// Source of the failed attempt, when there was one.
    pub previous_source: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub language: Language,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub feedback: Option<FailureFeedback>,
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>, language: Language) -> Self {
        Self {
            prompt: prompt.into(),
            language,
            constraints: Vec::new(),
            feedback: None,
        }
    }

    pub fn with_constraints(mut self, constraints: Vec<String>) -> Self {
        self.constraints = constraints;
        self
    }

    /// The same request carrying feedback from a failed attempt.
    pub fn refine(&self, feedback: FailureFeedback) -> Self {
        Self {
            feedback: Some(feedback),
            ..self.clone()
        }
    }

    /// Plain-text user message describing the request.
    pub fn render(&self) -> String {
        let mut text = format!("Requirement: {}\n", self.prompt);
        if !self.constraints.is_empty() {
            text.push_str("\nConstraints:\n");
            for c in &self.constraints {
                text.push_str(&format!("- {c}\n"));
            }
        }
        if let Some(fb) = &self.feedback {
            text.push_str(&format!("\nAttempt {} failed", fb.attempt));
            if let Some(status) = fb.status {
                text.push_str(&format!(" with status {status}"));
            }
            if let Some(code) = fb.exit_code {
                text.push_str(&format!(" (exit code {code})"));
            }
            text.push_str(".\n");
            if !fb.detail.is_empty() {
                text.push_str(&format!("\nError output:\n{}\n", fb.detail));
            }
            if let Some(src) = &fb.previous_source {
                text.push_str(&format!(
                    "\nPrevious code:\n```{}\n{}\n```\n",
                    self.language,
                    src.trim_end()
                ));
            }
            text.push_str("\nFix the problem and return the complete corrected program.\n");
        }
        text
    }
}

/// Failure of the generator call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum GenerationError {
    #[error("generator not configured: {0}")]
    NotConfigured(String),

    #[error("generator rate limited the request")]
    RateLimited { retry_after_ms: Option<u64> },

    #[error("generator did not answer within {0}ms")]
    Timeout(u64),

    #[error("network error talking to generator: {0}")]
    Network(String),

    #[error("generator service error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("generator rejected the request (status {status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("generator returned no code")]
    EmptyResponse,

    #[error("malformed generator response: {0}")]
    Malformed(String),
}

impl GenerationError {
    /// Retryable errors consume one refine attempt; the rest end the
    /// pipeline immediately.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            GenerationError::RateLimited { .. }
                | GenerationError::Timeout(_)
                | GenerationError::Network(_)
                | GenerationError::Upstream { .. }
                | GenerationError::EmptyResponse
                | GenerationError::Malformed(_)
        )
    }

    /// Delay the service asked for before the next call.
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GenerationError::RateLimited { retry_after_ms } => *retry_after_ms,
            _ => None,
        }
    }
}

impl From<reqwest::Error> for GenerationError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            GenerationError::Malformed(err.to_string())
        } else {
            GenerationError::Network(err.to_string())
        }
    }
}

/// Produces source code for a request. Possibly slow, rate limited and
/// remote.
#[async_trait]
pub trait Generator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<SourceArtifact, GenerationError>;
}

/// Pull the program out of a model reply: the body of the first fenced
/// block if there is one, the whole reply otherwise.
pub fn extract_code(reply: &str) -> String {
    let Some(open) = reply.find("```") else {
        return reply.trim().to_string();
    };
    let after_fence = &reply[open + 3..];
    // Skip the info string (```python).
    let body_start = after_fence.find('\n').map(|i| i + 1).unwrap_or(after_fence.len());
    let body = &after_fence[body_start..];
    let body = match body.find("```") {
        Some(close) => &body[..close],
        None => body,
    };
    body.trim_matches('\n').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_fenced_code() {
        let reply = "Here you go:\n```python\nprint('hi')\n```\nEnjoy.";
        assert_eq!(extract_code(reply), "print('hi')");
    }

    #[test]
    fn test_extract_unfenced_reply() {
        assert_eq!(extract_code("  echo ok\n"), "echo ok");
    }

    #[test]
    fn test_extract_unterminated_fence() {
        assert_eq!(extract_code("```js\nconsole.log(1)\n"), "console.log(1)");
    }

    #[test]
    fn test_retryable_classification() {
        assert!(GenerationError::RateLimited { retry_after_ms: Some(10) }.is_retryable());
        assert!(GenerationError::Timeout(100).is_retryable());
        assert!(GenerationError::Upstream { status: 503, body: String::new() }.is_retryable());
        assert!(!GenerationError::Rejected { status: 400, body: String::new() }.is_retryable());
        assert!(!GenerationError::NotConfigured("no key".into()).is_retryable());
    }

    #[test]
    fn test_render_includes_feedback() {
        let req = GenerationRequest::new("print a greeting", Language::Python)
            .with_constraints(vec!["no third-party imports".into()]);
        assert!(!req.render().contains("failed"));

        let refined = req.refine(FailureFeedback {
            attempt: 1,
            status: Some(ExecutionStatus::RuntimeError),
            exit_code: Some(1),
            detail: "NameError: name 'x' is not defined".into(),
            previous_source: Some("print(x)".into()),
        });
        let text = refined.render();
        assert!(text.contains("- no third-party imports"));
        assert!(text.contains("Attempt 1 failed with status runtime_error (exit code 1)."));
        assert!(text.contains("NameError"));
        assert!(text.contains("```python\nprint(x)\n```"));
        assert_eq!(refined.prompt, req.prompt);
    }
}
