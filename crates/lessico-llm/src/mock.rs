//! Deterministic providers for tests and dry runs.

use crate::llm::{
    CompletionRequest, CompletionResponse, FinishReason, LLMError, LLMProvider, ModelInfo, Usage,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

fn response(content: String, model: &str) -> CompletionResponse {
    CompletionResponse {
        content,
        finish_reason: FinishReason::Stop,
        usage: Usage::default(),
        model: model.to_string(),
    }
}

/// Mock provider cycling through canned responses.
pub struct MockProvider {
    responses: Vec<String>,
    response_idx: AtomicUsize,
}

impl MockProvider {
    pub fn new(responses: Vec<String>) -> Self {
        Self {
            responses,
            response_idx: AtomicUsize::new(0),
        }
    }

    pub fn always(response: &str) -> Self {
        Self::new(vec![response.to_string()])
    }

    /// Number of completions served so far.
    pub fn calls(&self) -> usize {
        self.response_idx.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LLMProvider for MockProvider {
    async fn complete(&self, _request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        let idx = self.response_idx.fetch_add(1, Ordering::SeqCst);
        if self.responses.is_empty() {
            return Err(LLMError::EmptyResponse);
        }
        Ok(response(self.responses[idx % self.responses.len()].clone(), "mock"))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "mock".to_string(),
            supports_json_mode: true,
        }
    }
}

/// Provider answering each prompt through a closure.
///
/// Lets tests act as an oracle keyed on prompt content, independent of call
/// order, which matters once requests run concurrently.
pub struct FnProvider<F> {
    answer: F,
    calls: AtomicUsize,
}

impl<F> FnProvider<F>
where
    F: Fn(&str) -> Result<String, LLMError> + Send + Sync,
{
    pub fn new(answer: F) -> Self {
        Self {
            answer,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl<F> LLMProvider for FnProvider<F>
where
    F: Fn(&str) -> Result<String, LLMError> + Send + Sync,
{
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LLMError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.answer)(request.prompt()).map(|content| response(content, "fn"))
    }

    fn model_info(&self) -> ModelInfo {
        ModelInfo {
            name: "fn".to_string(),
            supports_json_mode: true,
        }
    }
}
