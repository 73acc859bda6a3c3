//! LLM API Providers
//!
//! Concrete HTTP clients for Mistral/OpenAI-compatible chat endpoints,
//! Anthropic, and local OpenAI-compatible servers.

use super::*;
use async_trait::async_trait;
use reqwest::Client;
use std::time::Duration;

fn http_client(config: &LLMConfig) -> Result<Client, LLMError> {
    Client::builder()
        .timeout(Duration::from_secs(config.timeout_secs))
        .build()
        .map_err(|e| LLMError::Network(format!("cannot build HTTP client: {e}")))
}

fn chat_messages(request: &CompletionRequest) -> Vec<serde_json::Value> {
    request
        .messages
        .iter()
        .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
        .collect()
}

fn retry_after_ms(response: &reqwest::Response) -> u64 {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(60)
        * 1000
}

async fn error_for_status(response: reqwest::Response) -> Result<reqwest::Response, LLMError> {
    let status = response.status();
    if status.as_u16() == 429 {
        return Err(LLMError::RateLimited {
            retry_after_ms: retry_after_ms(&response),
        });
    }
    if status.is_server_error() {
        let text = response.text().await.unwrap_or_default();
        return Err(LLMError::Network(format!("server error {status}: {text}")));
    }
    if !status.is_success() {
        let text = response.text().await.unwrap_or_default();
        return Err(LLMError::Api(format!("{status}: {text}")));
    }
    Ok(response)
}

// ============================================================================
// OpenAI-compatible chat completions (Mistral, OpenAI)
// ============================================================================

pub struct ChatCompletionsClient {
    client: Client,
    config: LLMConfig,
}

impl ChatCompletionsClient {
    pub fn new(config: LLMConfig) -> Result<Self, LLMError> {
        Ok(Self {
            client: http_client(&config)?,
            config,
        })
    }

    fn url(&self) -> String {
        match self.config.provider {
            Provider::Local => format!("{}/v1/chat/completions", self.config.chat_base_url()),
            _ => format!("{}/chat/completions", self.config.chat_base_url()),
        }
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": chat_messages(request),
        });

        if let Some(max_tokens) = request.max_tokens {
            body["max_tokens"] = serde_json::json!(max_tokens);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }
        if request.json_mode {
            body["response_format"] = serde_json::json!({"type": "json_object"});
        }

        let mut builder = self
            .client
            .post(self.url())
            .header("Content-Type", "application/json")
            .json(&body);
        if !self.config.api_key.is_empty() {
            builder = builder.header("Authorization", format!("Bearer {}", self.config.api_key));
        }

        let response = builder
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;
        let response = error_for_status(response).await?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::InvalidResponse(e.to_string()))?;

        let content = data["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();

        let finish_reason = match data["choices"][0]["finish_reason"].as_str() {
            Some("length") => FinishReason::Length,
            Some("content_filter") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            finish_reason,
            usage: Usage {
                prompt_tokens: data["usage"]["prompt_tokens"].as_u64().unwrap_or(0) as usize,
                completion_tokens: data["usage"]["completion_tokens"].as_u64().unwrap_or(0) as usize,
            },
            model: self.config.model.clone(),
        })
    }
}

// ============================================================================
// Anthropic Provider
// ============================================================================

pub struct AnthropicClient {
    client: Client,
    config: LLMConfig,
}

impl AnthropicClient {
    pub fn new(config: LLMConfig) -> Result<Self, LLMError> {
        Ok(Self {
            client: http_client(&config)?,
            config,
        })
    }

    pub async fn complete(&self, request: &CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let url = self
            .config
            .base_url
            .as_deref()
            .map(|b| format!("{}/v1/messages", b.trim_end_matches('/')))
            .unwrap_or_else(|| "https://api.anthropic.com/v1/messages".to_string());

        let system = request
            .messages
            .iter()
            .find(|m| matches!(m.role, Role::System))
            .map(|m| m.content.clone());

        let messages: Vec<serde_json::Value> = request
            .messages
            .iter()
            .filter(|m| !matches!(m.role, Role::System))
            .map(|m| serde_json::json!({ "role": m.role.as_str(), "content": m.content }))
            .collect();

        let mut body = serde_json::json!({
            "model": self.config.model,
            "messages": messages,
            "max_tokens": request.max_tokens.unwrap_or(4096),
        });

        if let Some(sys) = system {
            body["system"] = serde_json::json!(sys);
        }
        if let Some(temp) = request.temperature {
            body["temperature"] = serde_json::json!(temp);
        }

        let response = self
            .client
            .post(url)
            .header("x-api-key", &self.config.api_key)
            .header("anthropic-version", "2023-06-01")
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| LLMError::Network(e.to_string()))?;
        let response = error_for_status(response).await?;

        let data: serde_json::Value = response
            .json()
            .await
            .map_err(|e| LLMError::InvalidResponse(e.to_string()))?;

        let content = data["content"][0]["text"].as_str().unwrap_or("").to_string();

        let finish_reason = match data["stop_reason"].as_str() {
            Some("max_tokens") => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        Ok(CompletionResponse {
            content,
            finish_reason,
            usage: Usage {
                prompt_tokens: data["usage"]["input_tokens"].as_u64().unwrap_or(0) as usize,
                completion_tokens: data["usage"]["output_tokens"].as_u64().unwrap_or(0) as usize,
            },
            model: self.config.model.clone(),
        })
    }
}

// ============================================================================
// Unified Client
// ============================================================================

/// Unified LLM client that dispatches to the appropriate provider
pub enum UnifiedClient {
    Chat(ChatCompletionsClient),
    Anthropic(AnthropicClient),
}

impl UnifiedClient {
    /// Create from configuration
    pub fn from_config(config: LLMConfig) -> Result<Self, ConfigError> {
        if !config.provider.is_compiled_in() {
            return Err(ConfigError::ProviderDisabled(config.provider));
        }
        let client = match config.provider {
            Provider::Mistral | Provider::OpenAI | Provider::Local => {
                ChatCompletionsClient::new(config).map(Self::Chat)
            }
            Provider::Anthropic => AnthropicClient::new(config).map(Self::Anthropic),
        };
        client.map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Create from environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_config(LLMConfig::from_env()?)
    }

    fn config(&self) -> &LLMConfig {
        match self {
            Self::Chat(c) => &c.config,
            Self::Anthropic(c) => &c.config,
        }
    }
}

#[async_trait]
impl LLMProvider for UnifiedClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        match self {
            Self::Chat(c) => c.complete(&request).await,
            Self::Anthropic(c) => c.complete(&request).await,
        }
    }

    fn model_info(&self) -> ModelInfo {
        let config = self.config();
        ModelInfo {
            name: config.model.clone(),
            supports_json_mode: !matches!(config.provider, Provider::Anthropic),
        }
    }
}
