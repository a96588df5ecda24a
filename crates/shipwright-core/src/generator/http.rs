//! Generator adapter for an OpenAI-compatible chat completions endpoint.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{extract_code, GenerationError, GenerationRequest, Generator};
use crate::domain::SourceArtifact;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpGeneratorConfig {
    /// Base URL; `/chat/completions` is appended.
    pub endpoint: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub temperature: f32,
    /// Transport-level timeout for one request.
    pub request_timeout_ms: u64,
}

impl Default for HttpGeneratorConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.openai.com/v1".to_string(),
            model: "gpt-4".to_string(),
            api_key: None,
            temperature: 0.7,
            request_timeout_ms: 120_000,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    temperature: f32,
}

#[derive(Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

pub struct HttpGenerator {
    config: HttpGeneratorConfig,
    client: reqwest::Client,
}

impl HttpGenerator {
    pub fn new(config: HttpGeneratorConfig) -> Result<Self, GenerationError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("shipwright/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_millis(config.request_timeout_ms))
            .build()
            .map_err(|e| GenerationError::NotConfigured(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn system_prompt(request: &GenerationRequest) -> String {
        format!(
            "You are an expert {} developer. Return one complete, runnable program \
             in a single fenced code block. It must run without arguments or input \
             and exit with status 0 on success.",
            request.language
        )
    }
}

#[async_trait]
impl Generator for HttpGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<SourceArtifact, GenerationError> {
        let api_key = self
            .config
            .api_key
            .as_deref()
            .ok_or_else(|| GenerationError::NotConfigured("no API key".to_string()))?;

        let body = ChatRequest {
            model: &self.config.model,
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: Self::system_prompt(request),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: request.render(),
                },
            ],
            temperature: self.config.temperature,
        };

        let url = format!("{}/chat/completions", self.config.endpoint.trim_end_matches('/'));
        debug!(url = %url, model = %self.config.model, language = %request.language, "requesting generation");

        let response = self
            .client
            .post(&url)
            .bearer_auth(api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = response.status();
        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let retry_after_ms = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(|secs| secs * 1000);
            warn!(?retry_after_ms, "generator rate limited");
            return Err(GenerationError::RateLimited { retry_after_ms });
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let body: String = body.chars().take(500).collect();
            return Err(if status.is_server_error() {
                GenerationError::Upstream {
                    status: status.as_u16(),
                    body,
                }
            } else {
                GenerationError::Rejected {
                    status: status.as_u16(),
                    body,
                }
            });
        }

        let reply: ChatResponse = response.json().await.map_err(|e| self.transport_error(e))?;
        let content = reply
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| GenerationError::Malformed("response has no choices".to_string()))?;

        let code = extract_code(&content);
        if code.trim().is_empty() {
            return Err(GenerationError::EmptyResponse);
        }
        Ok(SourceArtifact::new(code, request.language))
    }
}

impl HttpGenerator {
    fn transport_error(&self, err: reqwest::Error) -> GenerationError {
        if err.is_timeout() {
            GenerationError::Timeout(self.config.request_timeout_ms)
        } else {
            err.into()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Language;

    #[tokio::test]
    async fn test_missing_api_key_is_not_retryable() {
        let generator = HttpGenerator::new(HttpGeneratorConfig::default()).unwrap();
        let err = generator
            .generate(&GenerationRequest::new("hello", Language::Python))
            .await
            .unwrap_err();
        assert!(matches!(err, GenerationError::NotConfigured(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_api_key_is_never_serialized() {
        let config = HttpGeneratorConfig {
            api_key: Some("sk-secret".to_string()),
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("sk-secret"));
    }

    #[test]
    fn test_chat_response_parses() {
        let raw = r#"{"choices":[{"message":{"role":"assistant","content":"```sh\necho hi\n```"}}]}"#;
        let parsed: ChatResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(extract_code(&parsed.choices[0].message.content), "echo hi");
    }
}
