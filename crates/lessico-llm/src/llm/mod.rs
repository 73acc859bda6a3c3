//! Model oracle interface.
//!
//! Everything the pipeline knows about a language model is the
//! [`LLMProvider`] trait: a request goes in, raw text comes out. Real HTTP
//! clients live in [`providers`] (behind cargo features); tests use the
//! deterministic providers in [`crate::mock`].
//!
//! The model is untrusted. Callers parse its text with
//! [`extract_json_object`] and treat anything unparseable as a skipped item,
//! never as a fatal error.

pub mod config;
#[cfg(any(
    feature = "mistral",
    feature = "openai",
    feature = "anthropic",
    feature = "local"
))]
pub mod providers;

pub use config::{ConfigError, LLMConfig, Provider};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

// ============================================================================
// LLM Provider Interface
// ============================================================================

/// Trait for LLM API providers
#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Generate completion
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError>;

    /// Get model info
    fn model_info(&self) -> ModelInfo;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub max_tokens: Option<usize>,
    pub temperature: Option<f32>,
    /// Ask the provider for a JSON object response when it supports it.
    pub json_mode: bool,
}

impl CompletionRequest {
    /// A single user turn.
    pub fn user(prompt: impl Into<String>) -> Self {
        Self {
            messages: vec![Message {
                role: Role::User,
                content: prompt.into(),
            }],
            max_tokens: None,
            temperature: None,
            json_mode: false,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_json_mode(mut self) -> Self {
        self.json_mode = true;
        self
    }

    /// Text of the first user message (the prompt, for single-turn requests).
    pub fn prompt(&self) -> &str {
        self.messages
            .iter()
            .find(|m| matches!(m.role, Role::User))
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone)]
pub struct CompletionResponse {
    pub content: String,
    pub finish_reason: FinishReason,
    pub usage: Usage,
    pub model: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    Stop,
    Length,
    ContentFilter,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct ModelInfo {
    pub name: String,
    pub supports_json_mode: bool,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum LLMError {
    #[error("API error: {0}")]
    Api(String),
    #[error("Rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },
    #[error("Invalid response: {0}")]
    InvalidResponse(String),
    #[error("Empty response from model")]
    EmptyResponse,
    #[error("Parsing error: {0}")]
    ParseError(String),
    #[error("Network error: {0}")]
    Network(String),
}

impl LLMError {
    /// Errors worth another attempt within the same run.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LLMError::RateLimited { .. } | LLMError::Network(_) | LLMError::EmptyResponse
        )
    }
}

// ============================================================================
// Bounded retries
// ============================================================================

/// How often a single request may be retried before the item is skipped.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
    /// Upper bound on a single wait, including server-requested ones.
    pub max_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            backoff: Duration::from_millis(150),
            max_wait: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    fn wait_for(&self, attempt: u32, error: &LLMError) -> Duration {
        let linear = self.backoff * (attempt + 1);
        let wait = match error {
            LLMError::RateLimited { retry_after_ms } => {
                linear.max(Duration::from_millis(*retry_after_ms))
            }
            _ => linear,
        };
        wait.min(self.max_wait)
    }
}

/// Call the provider, retrying transient failures with linear back-off.
///
/// An empty completion counts as a transient failure.
pub async fn complete_with_retry(
    provider: &dyn LLMProvider,
    request: &CompletionRequest,
    policy: RetryPolicy,
) -> Result<CompletionResponse, LLMError> {
    let mut attempt = 0;
    loop {
        let result = match provider.complete(request.clone()).await {
            Ok(resp) if resp.content.trim().is_empty() => Err(LLMError::EmptyResponse),
            other => other,
        };
        match result {
            Ok(resp) => return Ok(resp),
            Err(e) if e.is_transient() && attempt < policy.max_retries => {
                let wait = policy.wait_for(attempt, &e);
                tracing::debug!(attempt, error = %e, wait_ms = wait.as_millis() as u64, "retrying model call");
                tokio::time::sleep(wait).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

// ============================================================================
// JSON extraction
// ============================================================================

/// Pull the first complete JSON object out of model text.
///
/// Models wrap JSON in prose or markdown fences and sometimes trail extra
/// content, so a plain parse is tried first and then a brace-balanced scan
/// (string-aware) for the first object.
pub fn extract_json_object(text: &str) -> Result<serde_json::Value, LLMError> {
    let trimmed = text.trim();
    if let Ok(v @ serde_json::Value::Object(_)) = serde_json::from_str(trimmed) {
        return Ok(v);
    }

    let Some(start) = trimmed.find('{') else {
        return Err(LLMError::ParseError("no JSON object in response".to_string()));
    };

    let mut depth: i64 = 0;
    let mut in_string = false;
    let mut escape = false;
    let mut end: Option<usize> = None;

    for (idx, ch) in trimmed.char_indices().skip_while(|(i, _)| *i < start) {
        if in_string {
            if escape {
                escape = false;
                continue;
            }
            match ch {
                '\\' => escape = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }

        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    end = Some(idx);
                    break;
                }
            }
            _ => {}
        }
    }

    let Some(end) = end else {
        return Err(LLMError::ParseError("unterminated JSON object".to_string()));
    };

    serde_json::from_str(&trimmed[start..=end])
        .map_err(|e| LLMError::ParseError(format!("invalid JSON: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_extract_plain_object() {
        let v = extract_json_object(r#"{"a": 1}"#).unwrap();
        assert_eq!(v["a"], 1);
    }

    #[test]
    fn test_extract_from_fenced_prose() {
        let text = "Ecco il risultato:\n```json\n{\"gatto\": {\"morpho\": {\"a\": \"felino\"}}}\n```\nSpero aiuti {";
        let v = extract_json_object(text).unwrap();
        assert_eq!(v["gatto"]["morpho"]["a"], "felino");
    }

    #[test]
    fn test_extract_ignores_braces_inside_strings() {
        let v = extract_json_object(r#"note {"k": "a } b", "n": {"x": 1}} tail"#).unwrap();
        assert_eq!(v["k"], "a } b");
        assert_eq!(v["n"]["x"], 1);
    }

    #[test]
    fn test_extract_failures() {
        assert!(matches!(
            extract_json_object("nessun json qui"),
            Err(LLMError::ParseError(_))
        ));
        assert!(extract_json_object("{\"a\": ").is_err());
        assert!(extract_json_object("[1, 2]").is_err());
    }

    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for Flaky {
        async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                return Err(LLMError::Network("reset".to_string()));
            }
            Ok(CompletionResponse {
                content: "ok".to_string(),
                finish_reason: FinishReason::Stop,
                usage: Usage::default(),
                model: "flaky".to_string(),
            })
        }

        fn model_info(&self) -> ModelInfo {
            ModelInfo {
                name: "flaky".to_string(),
                supports_json_mode: false,
            }
        }
    }

    fn fast_policy(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            backoff: Duration::from_millis(1),
            max_wait: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let provider = Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        };
        let resp = complete_with_retry(&provider, &CompletionRequest::user("x"), fast_policy(3))
            .await
            .unwrap();
        assert_eq!(resp.content, "ok");
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let provider = Flaky {
            failures: 10,
            calls: AtomicUsize::new(0),
        };
        let err = complete_with_retry(&provider, &CompletionRequest::user("x"), fast_policy(2))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::Network(_)));
        assert_eq!(provider.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_empty_content_counts_as_failure() {
        let provider = MockProvider::always("   ");
        let err = complete_with_retry(&provider, &CompletionRequest::user("x"), fast_policy(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LLMError::EmptyResponse));
    }
}
