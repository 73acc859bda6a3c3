//! Candidate generation: ask the model for forms derived from a noun.
//!
//! The model is an unreliable oracle. Its answer is parsed structurally and
//! nothing more; plausibility is the corpus filter's job.

use std::sync::Arc;

use lessico_lexicon::{CandidateProposal, PartOfSpeech};
use serde_json::Value;

use crate::batch::{BatchKind, BatchRequestLine};
use crate::llm::{
    complete_with_retry, extract_json_object, CompletionRequest, LLMError, LLMProvider, RetryPolicy,
};

pub const GENERATION_ID_PREFIX: &str = "gen-";
pub const DEFAULT_TEMPERATURE: f32 = 0.7;

#[derive(Debug, thiserror::Error)]
pub enum GenerationError {
    #[error("model call failed: {0}")]
    Oracle(#[from] LLMError),
    #[error("unusable answer for {lemma:?}: {reason}")]
    Malformed { lemma: String, reason: String },
}

#[derive(Clone)]
pub struct CandidateGenerator {
    provider: Arc<dyn LLMProvider>,
    temperature: f32,
    retry: RetryPolicy,
    model: Option<String>,
}

impl CandidateGenerator {
    pub fn new(provider: Arc<dyn LLMProvider>) -> Self {
        Self {
            provider,
            temperature: DEFAULT_TEMPERATURE,
            retry: RetryPolicy::default(),
            model: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Model name written into batch request bodies.
    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn prompt(lemma: &str) -> String {
        format!(
            r#"Riceverai un sostantivo italiano. Restituisci l'aggettivo, l'avverbio e il verbo
morfologicamente derivati da esso ed effettivamente **esistenti** in italiano,
oppure "N/A" se non esistono.
Segui queste regole:
- **Aggettivo**: derivato dalla radice del sostantivo.
- **Avverbio**: termina in "-mente" e deriva dall'aggettivo correlato.
- **Verbo**: derivato dalla radice del sostantivo.
- **Non inventare parole**: in caso di dubbio usa "N/A".
- Rispondi solo con JSON in questo formato:
{{"allegria": {{"morpho": {{"a": "allegro", "r": "allegramente", "v": "rallegrare"}}}}}}

Parola da analizzare:
{lemma}"#
        )
    }

    pub fn request(&self, lemma: &str) -> CompletionRequest {
        CompletionRequest::user(Self::prompt(lemma))
            .with_temperature(self.temperature)
            .with_json_mode()
    }

    /// Ask for derivations of one noun, retrying transient failures.
    pub async fn generate(&self, lemma: &str) -> Result<Vec<CandidateProposal>, GenerationError> {
        let response =
            complete_with_retry(self.provider.as_ref(), &self.request(lemma), self.retry).await?;
        Self::parse_response(lemma, &response.content)
    }

    pub fn custom_id(lemma: &str) -> String {
        format!("{GENERATION_ID_PREFIX}{lemma}")
    }

    /// The lemma a generation `custom_id` was issued for.
    pub fn lemma_from_custom_id(custom_id: &str) -> Option<&str> {
        custom_id
            .strip_prefix(GENERATION_ID_PREFIX)
            .filter(|l| !l.is_empty())
    }

    /// Same prompt as [`generate`](Self::generate), as a batch line.
    pub fn batch_request(&self, lemma: &str) -> BatchRequestLine {
        let mut line = BatchRequestLine::new(
            Self::custom_id(lemma),
            BatchKind::Generation,
            Self::prompt(lemma),
            self.temperature,
        )
        .with_model(self.model.clone());
        line.lemma = Some(lemma.to_string());
        line
    }

    /// Turn raw model text into proposals.
    ///
    /// Accepts `{"<lemma>": {"morpho": {...}}}` or a bare `{"morpho": {...}}`.
    /// Values may be strings or arrays of strings; `"N/A"`, blanks, unknown
    /// categories and non-string values are dropped.
    pub fn parse_response(lemma: &str, text: &str) -> Result<Vec<CandidateProposal>, GenerationError> {
        let value = extract_json_object(text).map_err(|e| GenerationError::Malformed {
            lemma: lemma.to_string(),
            reason: e.to_string(),
        })?;

        let Some(morpho) = find_morpho(lemma, &value) else {
            return Err(GenerationError::Malformed {
                lemma: lemma.to_string(),
                reason: "no `morpho` object".to_string(),
            });
        };

        let mut proposals: Vec<CandidateProposal> = Vec::new();
        for (key, forms) in morpho {
            let Ok(pos) = key.parse::<PartOfSpeech>() else {
                continue;
            };
            if !pos.is_derivable() {
                continue;
            }
            for form in string_values(forms) {
                let proposal = CandidateProposal::new(lemma, form, pos);
                if !proposals.contains(&proposal) {
                    proposals.push(proposal);
                }
            }
        }
        Ok(proposals)
    }
}

impl std::fmt::Debug for CandidateGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CandidateGenerator")
            .field("model", &self.provider.model_info().name)
            .field("temperature", &self.temperature)
            .field("retry", &self.retry)
            .finish()
    }
}

fn find_morpho<'a>(lemma: &str, value: &'a Value) -> Option<&'a serde_json::Map<String, Value>> {
    let obj = value.as_object()?;
    if let Some(m) = obj.get("morpho").and_then(Value::as_object) {
        return Some(m);
    }
    let keyed = obj
        .iter()
        .find(|(k, _)| k.trim().eq_ignore_ascii_case(lemma.trim()))
        .map(|(_, v)| v)
        // Models sometimes echo the noun with different casing or accents;
        // a single top-level key is unambiguous.
        .or_else(|| (obj.len() == 1).then(|| obj.values().next()).flatten())?;
    keyed.get("morpho").and_then(Value::as_object)
}

fn string_values(value: &Value) -> Vec<&str> {
    let candidates: Vec<&str> = match value {
        Value::String(s) => vec![s.as_str()],
        Value::Array(items) => items.iter().filter_map(Value::as_str).collect(),
        _ => Vec::new(),
    };
    candidates
        .into_iter()
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("n/a"))
        .collect()
}
