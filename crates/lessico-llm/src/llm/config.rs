//! Provider selection from the environment.

// ============================================================================
// Configuration
// ============================================================================

/// LLM configuration loaded from environment or built explicitly
#[derive(Debug, Clone)]
pub struct LLMConfig {
    pub provider: Provider,
    pub api_key: String,
    pub model: String,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provider {
    Mistral,
    OpenAI,
    Anthropic,
    Local,
}

impl Provider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Mistral => "mistral",
            Provider::OpenAI => "openai",
            Provider::Anthropic => "anthropic",
            Provider::Local => "local",
        }
    }

    /// Whether this build carries an HTTP client for the provider.
    pub fn is_compiled_in(&self) -> bool {
        match self {
            Provider::Mistral => cfg!(feature = "mistral"),
            Provider::OpenAI => cfg!(feature = "openai"),
            Provider::Anthropic => cfg!(feature = "anthropic"),
            Provider::Local => cfg!(feature = "local"),
        }
    }
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub const MISTRAL_DEFAULT_MODEL: &str = "mistral-large-latest";
pub const MISTRAL_BASE_URL: &str = "https://api.mistral.ai/v1";
pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";

impl LLMConfig {
    /// Load from environment variables.
    ///
    /// Checked in order: `MISTRAL_API_KEY`, `OPENAI_API_KEY`,
    /// `ANTHROPIC_API_KEY`, `LOCAL_LLM_URL`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Same as [`LLMConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        if let Some(key) = var("MISTRAL_API_KEY") {
            return Ok(Self {
                model: var("MISTRAL_MODEL").unwrap_or_else(|| MISTRAL_DEFAULT_MODEL.to_string()),
                base_url: var("MISTRAL_BASE_URL"),
                ..Self::mistral(&key)
            });
        }

        if let Some(key) = var("OPENAI_API_KEY") {
            let model = var("OPENAI_MODEL").unwrap_or_else(|| "gpt-4o-mini".to_string());
            return Ok(Self {
                base_url: var("OPENAI_BASE_URL"),
                ..Self::openai(&key, &model)
            });
        }

        if let Some(key) = var("ANTHROPIC_API_KEY") {
            let model =
                var("ANTHROPIC_MODEL").unwrap_or_else(|| "claude-3-5-sonnet-latest".to_string());
            return Ok(Self::anthropic(&key, &model));
        }

        if let Some(url) = var("LOCAL_LLM_URL") {
            let model = var("LOCAL_LLM_MODEL").unwrap_or_else(|| "default".to_string());
            return Ok(Self::local(&url, &model));
        }

        Err(ConfigError::NoProviderConfigured)
    }

    pub fn mistral(api_key: &str) -> Self {
        Self {
            provider: Provider::Mistral,
            api_key: api_key.to_string(),
            model: MISTRAL_DEFAULT_MODEL.to_string(),
            base_url: None,
            timeout_secs: 60,
        }
    }

    pub fn openai(api_key: &str, model: &str) -> Self {
        Self {
            provider: Provider::OpenAI,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: None,
            timeout_secs: 60,
        }
    }

    pub fn anthropic(api_key: &str, model: &str) -> Self {
        Self {
            provider: Provider::Anthropic,
            api_key: api_key.to_string(),
            model: model.to_string(),
            base_url: None,
            timeout_secs: 60,
        }
    }

    pub fn local(url: &str, model: &str) -> Self {
        Self {
            provider: Provider::Local,
            api_key: String::new(),
            model: model.to_string(),
            base_url: Some(url.to_string()),
            timeout_secs: 120,
        }
    }

    /// Base URL of an OpenAI-compatible chat endpoint.
    pub fn chat_base_url(&self) -> &str {
        match (&self.base_url, self.provider) {
            (Some(url), _) => url.trim_end_matches('/'),
            (None, Provider::Mistral) => MISTRAL_BASE_URL,
            (None, _) => OPENAI_BASE_URL,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("No LLM provider configured. Set MISTRAL_API_KEY, OPENAI_API_KEY, ANTHROPIC_API_KEY, or LOCAL_LLM_URL")]
    NoProviderConfigured,
    #[error("provider `{0}` is not compiled in; rebuild with `--features {0}`")]
    ProviderDisabled(Provider),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}
