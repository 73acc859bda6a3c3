//! Asynchronous batch jobs.
//!
//! A job is a JSONL file of requests keyed by `custom_id`. Results come back
//! as another JSONL file, possibly hours later, in any order, possibly
//! incomplete. [`BatchService`] separates the three steps so a later process
//! can pick up a job an earlier one submitted.

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::llm::{complete_with_retry, CompletionRequest, LLMProvider, RetryPolicy};

#[derive(Debug, thiserror::Error)]
pub enum BatchError {
    #[error("batch I/O failed for {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode batch request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("unknown batch job `{0}`")]
    UnknownJob(String),
    #[error("batch job `{0}` has no results yet")]
    NotReady(String),
}

impl BatchError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        BatchError::Io {
            path: path.display().to_string(),
            source,
        }
    }
}

// ============================================================================
// Wire format
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchKind {
    Generation,
    Scan,
}

impl BatchKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchKind::Generation => "generation",
            BatchKind::Scan => "scan",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    pub role: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResponseFormat {
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchBody {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<ResponseFormat>,
    pub messages: Vec<BatchMessage>,
}

/// One line of a submission file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchRequestLine {
    pub custom_id: String,
    pub kind: BatchKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lemma: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pair_ids: Vec<u64>,
    pub body: BatchBody,
}

impl BatchRequestLine {
    /// A single-prompt JSON-mode request.
    pub fn new(custom_id: impl Into<String>, kind: BatchKind, prompt: String, temperature: f32) -> Self {
        Self {
            custom_id: custom_id.into(),
            kind,
            lemma: None,
            pair_ids: Vec::new(),
            body: BatchBody {
                model: None,
                temperature: Some(temperature),
                response_format: Some(ResponseFormat {
                    kind: "json_object".to_string(),
                }),
                messages: vec![BatchMessage {
                    role: "user".to_string(),
                    content: prompt,
                }],
            },
        }
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.body.model = model;
        self
    }

    pub fn prompt(&self) -> &str {
        self.body
            .messages
            .iter()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or("")
    }

    pub fn to_completion_request(&self) -> CompletionRequest {
        let mut request = CompletionRequest::user(self.prompt());
        request.temperature = self.body.temperature;
        request.json_mode = self.body.response_format.is_some();
        request
    }
}

/// One line of a result file, reduced to what the pipeline needs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResultLine {
    pub custom_id: String,
    pub content: Option<String>,
    pub error: Option<String>,
}

impl BatchResultLine {
    pub fn ok(custom_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            content: Some(content.into()),
            error: None,
        }
    }

    pub fn failed(custom_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            custom_id: custom_id.into(),
            content: None,
            error: Some(error.into()),
        }
    }

    /// Interpret one provider result object.
    ///
    /// Content is read from `response.body.choices[0].message.content`, or a
    /// top-level `content` string. Returns `None` when there is no usable
    /// `custom_id`.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        let custom_id = match &value["custom_id"] {
            serde_json::Value::String(s) if !s.is_empty() => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            _ => return None,
        };

        let content = value["response"]["body"]["choices"][0]["message"]["content"]
            .as_str()
            .or_else(|| value["content"].as_str())
            .map(str::to_string);

        let error = match &value["error"] {
            serde_json::Value::Null => None,
            serde_json::Value::String(s) => Some(s.clone()),
            other => Some(
                other["message"]
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| other.to_string()),
            ),
        };

        Some(Self {
            custom_id,
            content,
            error,
        })
    }

    /// Usable model text, if any.
    pub fn text(&self) -> Option<&str> {
        self.content.as_deref().filter(|c| !c.trim().is_empty())
    }
}

/// Render request lines as JSONL.
pub fn write_request_lines(lines: &[BatchRequestLine]) -> Result<String, BatchError> {
    let mut out = String::new();
    for line in lines {
        out.push_str(&serde_json::to_string(line)?);
        out.push('\n');
    }
    Ok(out)
}

/// Parse a result file. Lines that are not JSON objects with a `custom_id`
/// are skipped and counted.
pub fn parse_result_lines(text: &str) -> (Vec<BatchResultLine>, usize) {
    let mut results = Vec::new();
    let mut skipped = 0usize;
    for line in text.lines().filter(|l| !l.trim().is_empty()) {
        match serde_json::from_str::<serde_json::Value>(line)
            .ok()
            .as_ref()
            .and_then(BatchResultLine::from_json)
        {
            Some(result) => results.push(result),
            None => skipped += 1,
        }
    }
    (results, skipped)
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BatchJobId(pub String);

impl BatchJobId {
    pub fn generate(kind: BatchKind) -> Self {
        let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        BatchJobId(format!("{}-{}-{}", kind.as_str(), stamp, &suffix[..8]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BatchJobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Completed,
}

#[async_trait]
pub trait BatchService: Send + Sync {
    async fn submit(&self, kind: BatchKind, lines: Vec<BatchRequestLine>) -> Result<BatchJobId, BatchError>;

    async fn poll(&self, id: &BatchJobId) -> Result<BatchStatus, BatchError>;

    async fn retrieve(&self, id: &BatchJobId) -> Result<Vec<BatchResultLine>, BatchError>;
}

/// Batch jobs exchanged as files with an external operator.
///
/// `submit` writes `<dir>/<job>.input.jsonl`; the operator uploads it to the
/// provider's batch API and drops the downloaded results at
/// `<dir>/<job>.output.jsonl`.
#[derive(Debug, Clone)]
pub struct FileBatchService {
    dir: PathBuf,
}

impl FileBatchService {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn input_path(&self, id: &BatchJobId) -> PathBuf {
        self.dir.join(format!("{id}.input.jsonl"))
    }

    pub fn output_path(&self, id: &BatchJobId) -> PathBuf {
        self.dir.join(format!("{id}.output.jsonl"))
    }
}

#[async_trait]
impl BatchService for FileBatchService {
    async fn submit(&self, kind: BatchKind, lines: Vec<BatchRequestLine>) -> Result<BatchJobId, BatchError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| BatchError::io(&self.dir, e))?;
        let id = BatchJobId::generate(kind);
        let path = self.input_path(&id);
        let body = write_request_lines(&lines)?;
        tokio::fs::write(&path, body)
            .await
            .map_err(|e| BatchError::io(&path, e))?;
        tracing::info!(job = %id, requests = lines.len(), path = %path.display(), "batch input written");
        Ok(id)
    }

    async fn poll(&self, id: &BatchJobId) -> Result<BatchStatus, BatchError> {
        let output = self.output_path(id);
        if tokio::fs::try_exists(&output).await.map_err(|e| BatchError::io(&output, e))? {
            return Ok(BatchStatus::Completed);
        }
        let input = self.input_path(id);
        if tokio::fs::try_exists(&input).await.map_err(|e| BatchError::io(&input, e))? {
            Ok(BatchStatus::Pending)
        } else {
            Err(BatchError::UnknownJob(id.to_string()))
        }
    }

    async fn retrieve(&self, id: &BatchJobId) -> Result<Vec<BatchResultLine>, BatchError> {
        if self.poll(id).await? == BatchStatus::Pending {
            return Err(BatchError::NotReady(id.to_string()));
        }
        let path = self.output_path(id);
        let text = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| BatchError::io(&path, e))?;
        let (results, skipped) = parse_result_lines(&text);
        if skipped > 0 {
            tracing::warn!(job = %id, skipped, "unreadable result lines ignored");
        }
        Ok(results)
    }
}

/// Runs every request immediately against a provider and keeps the results.
pub struct InlineBatchService {
    provider: Arc<dyn LLMProvider>,
    max_concurrent: usize,
    retry: RetryPolicy,
    jobs: Mutex<HashMap<BatchJobId, Vec<BatchResultLine>>>,
}

impl InlineBatchService {
    pub fn new(provider: Arc<dyn LLMProvider>, max_concurrent: usize) -> Self {
        Self {
            provider,
            max_concurrent: max_concurrent.max(1),
            retry: RetryPolicy::default(),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

#[async_trait]
impl BatchService for InlineBatchService {
    async fn submit(&self, kind: BatchKind, lines: Vec<BatchRequestLine>) -> Result<BatchJobId, BatchError> {
        let id = BatchJobId::generate(kind);
        let semaphore = Arc::new(Semaphore::new(self.max_concurrent));
        let mut tasks = JoinSet::new();

        for line in lines {
            let provider = Arc::clone(&self.provider);
            let semaphore = Arc::clone(&semaphore);
            let retry = self.retry;
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let request = line.to_completion_request();
                match complete_with_retry(provider.as_ref(), &request, retry).await {
                    Ok(resp) => BatchResultLine::ok(line.custom_id, resp.content),
                    Err(e) => BatchResultLine::failed(line.custom_id, e.to_string()),
                }
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(result) => results.push(result),
                // The request simply goes unanswered.
                Err(e) => tracing::warn!(job = %id, error = %e, "batch request task aborted"),
            }
        }

        tracing::info!(job = %id, results = results.len(), "inline batch finished");
        self.jobs.lock().insert(id.clone(), results);
        Ok(id)
    }

    async fn poll(&self, id: &BatchJobId) -> Result<BatchStatus, BatchError> {
        if self.jobs.lock().contains_key(id) {
            Ok(BatchStatus::Completed)
        } else {
            Err(BatchError::UnknownJob(id.to_string()))
        }
    }

    async fn retrieve(&self, id: &BatchJobId) -> Result<Vec<BatchResultLine>, BatchError> {
        self.jobs
            .lock()
            .get(id)
            .cloned()
            .ok_or_else(|| BatchError::UnknownJob(id.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::FnProvider;
    use tempfile::tempdir;

    #[test]
    fn test_request_line_shape() {
        let mut line = BatchRequestLine::new("gen-gatto", BatchKind::Generation, "prompt".into(), 0.7);
        line.lemma = Some("gatto".into());
        let value = serde_json::to_value(&line).unwrap();
        assert_eq!(value["custom_id"], "gen-gatto");
        assert_eq!(value["kind"], "generation");
        assert_eq!(value["lemma"], "gatto");
        assert!(value.get("pair_ids").is_none());
        assert_eq!(value["body"]["response_format"]["type"], "json_object");
        assert_eq!(value["body"]["messages"][0]["role"], "user");
        assert_eq!(value["body"]["messages"][0]["content"], "prompt");
    }

    #[test]
    fn test_result_line_variants() {
        let text = r#"
{"custom_id": "a", "response": {"status_code": 200, "body": {"choices": [{"message": {"content": "{\"x\": 1}"}}]}}}
{"custom_id": "b", "content": "plain"}
{"custom_id": "c", "error": {"message": "quota exceeded"}}
not json at all
{"no_id": true}
"#;
        let (results, skipped) = parse_result_lines(text);
        assert_eq!(skipped, 2);
        assert_eq!(results.len(), 3);
        assert_eq!(results[0].text(), Some("{\"x\": 1}"));
        assert_eq!(results[1].text(), Some("plain"));
        assert_eq!(results[2].text(), None);
        assert_eq!(results[2].error.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_file_service_lifecycle() {
        let dir = tempdir().unwrap();
        let service = FileBatchService::new(dir.path());
        let line = BatchRequestLine::new("scan-0", BatchKind::Scan, "p".into(), 0.0);
        let id = service.submit(BatchKind::Scan, vec![line]).await.unwrap();

        assert!(id.as_str().starts_with("scan-"));
        assert_eq!(service.poll(&id).await.unwrap(), BatchStatus::Pending);
        assert!(matches!(service.retrieve(&id).await, Err(BatchError::NotReady(_))));

        std::fs::write(
            service.output_path(&id),
            "{\"custom_id\": \"scan-0\", \"content\": \"{}\"}\n",
        )
        .unwrap();
        assert_eq!(service.poll(&id).await.unwrap(), BatchStatus::Completed);
        let results = service.retrieve(&id).await.unwrap();
        assert_eq!(results, vec![BatchResultLine::ok("scan-0", "{}")]);

        let missing = BatchJobId("nope".into());
        assert!(matches!(service.poll(&missing).await, Err(BatchError::UnknownJob(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_file_service_concurrent_jobs_in_nested_dir() {
        let dir = tempdir().unwrap();
        let service = Arc::new(FileBatchService::new(dir.path().join("a").join("b")));

        let mut tasks = JoinSet::new();
        for n in 0..4 {
            let service = Arc::clone(&service);
            tasks.spawn(async move {
                let line = BatchRequestLine::new(format!("gen-{n}"), BatchKind::Generation, "p".into(), 0.7);
                service.submit(BatchKind::Generation, vec![line]).await
            });
        }
        let mut ids = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            ids.push(joined.unwrap().unwrap());
        }

        assert_eq!(ids.len(), 4);
        for id in &ids {
            assert!(service.input_path(id).exists());
            assert_eq!(service.poll(id).await.unwrap(), BatchStatus::Pending);
        }
    }

    #[tokio::test]
    async fn test_inline_service_runs_every_line() {
        let provider = Arc::new(FnProvider::new(|prompt: &str| {
            if prompt == "boom" {
                Err(crate::llm::LLMError::Api("bad request".into()))
            } else {
                Ok(format!("echo:{prompt}"))
            }
        }));
        let service = InlineBatchService::new(provider, 2).with_retry(RetryPolicy::none());
        let lines = ["uno", "due", "boom"]
            .iter()
            .map(|p| BatchRequestLine::new(format!("id-{p}"), BatchKind::Generation, p.to_string(), 0.7))
            .collect();

        let id = service.submit(BatchKind::Generation, lines).await.unwrap();
        assert_eq!(service.poll(&id).await.unwrap(), BatchStatus::Completed);

        let mut results = service.retrieve(&id).await.unwrap();
        results.sort_by(|a, b| a.custom_id.cmp(&b.custom_id));
        assert_eq!(results.len(), 3);
        assert!(results[0].error.is_some());
        assert_eq!(results[1].text(), Some("echo:due"));
        assert_eq!(results[2].text(), Some("echo:uno"));
    }
}
