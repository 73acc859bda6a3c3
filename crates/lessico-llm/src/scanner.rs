//! Second-pass validation of stored relations.
//!
//! Stored noun/derived-form pairs are re-submitted to the model in batches
//! and judged one by one, keyed by derived-form id. Verdicts only ever
//! produce *flags*; nothing here touches the store.
//!
//! The model's answers are untrusted. A batch whose answer is missing,
//! unparseable, or does not cover every submitted id contributes no flags and
//! is reported for retry instead.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use chrono::{DateTime, Utc};
use lessico_storage::{DerivedFormId, ScanPair};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::batch::{BatchError, BatchJobId, BatchKind, BatchRequestLine, BatchResultLine, BatchService, BatchStatus};
use crate::llm::extract_json_object;

pub const SCAN_ID_PREFIX: &str = "scan-";
pub const DEFAULT_MAX_PAIRS_PER_REQUEST: usize = 25;
pub const DEFAULT_SCAN_TEMPERATURE: f32 = 0.0;

const SCAN_JOB_VERSION: &str = "lessico_scan_job_v1";
const DEFAULT_REASON: &str = "no morphological connection according to the model";

// ============================================================================
// Jobs and outcomes
// ============================================================================

/// One judgment request: a slice of pairs under one `custom_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanBatch {
    pub custom_id: String,
    pub pair_ids: Vec<DerivedFormId>,
}

/// A submitted scan, persisted so a later process can collect it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanJob {
    pub version: String,
    pub job_id: BatchJobId,
    pub submitted_at: DateTime<Utc>,
    pub batches: Vec<ScanBatch>,
    /// The pairs as they were when submitted.
    pub pairs: Vec<ScanPair>,
}

impl ScanJob {
    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let job: ScanJob = read_json(path)?;
        if job.version != SCAN_JOB_VERSION {
            return Err(BatchError::UnknownJob(format!(
                "{} (unsupported job file version {:?})",
                job.job_id, job.version
            )));
        }
        Ok(job)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SuspicionFlag {
    pub derived_form_id: DerivedFormId,
    pub reason: String,
}

/// A flag together with the pair it concerns, as shown to a reviewer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlaggedPair {
    pub pair: ScanPair,
    pub reason: String,
}

impl FlaggedPair {
    pub fn suspicion_flag(&self) -> SuspicionFlag {
        SuspicionFlag {
            derived_form_id: self.pair.derived_form_id,
            reason: self.reason.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchFailure {
    pub custom_id: String,
    pub pair_ids: Vec<DerivedFormId>,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanOutcome {
    /// Ordered by derived-form id.
    pub flags: Vec<FlaggedPair>,
    pub failed_batches: Vec<BatchFailure>,
    pub unanswered: Vec<ScanBatch>,
    /// Pairs that received a verdict, flagged or not.
    pub judged: usize,
}

impl ScanOutcome {
    pub fn suspicion_flags(&self) -> Vec<SuspicionFlag> {
        self.flags.iter().map(FlaggedPair::suspicion_flag).collect()
    }

    /// Pairs that need another scan: failed plus unanswered.
    pub fn retry_pair_ids(&self) -> Vec<DerivedFormId> {
        let mut ids: Vec<DerivedFormId> = self
            .failed_batches
            .iter()
            .flat_map(|f| f.pair_ids.iter().copied())
            .chain(self.unanswered.iter().flat_map(|b| b.pair_ids.iter().copied()))
            .collect();
        ids.sort_unstable();
        ids
    }

    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        write_json(path, self)
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        read_json(path)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), BatchError> {
    let text = serde_json::to_string_pretty(value)?;
    std::fs::write(path, text).map_err(|source| BatchError::Io {
        path: path.display().to_string(),
        source,
    })
}

fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, BatchError> {
    let text = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(serde_json::from_str(&text)?)
}

// ============================================================================
// Scanner
// ============================================================================

#[derive(Debug, Clone)]
pub struct SuspicionScanner {
    max_pairs_per_request: usize,
    temperature: f32,
    model: Option<String>,
}

impl Default for SuspicionScanner {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAIRS_PER_REQUEST)
    }
}

impl SuspicionScanner {
    pub fn new(max_pairs_per_request: usize) -> Self {
        Self {
            max_pairs_per_request: max_pairs_per_request.max(1),
            temperature: DEFAULT_SCAN_TEMPERATURE,
            model: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_model(mut self, model: Option<String>) -> Self {
        self.model = model;
        self
    }

    pub fn max_pairs_per_request(&self) -> usize {
        self.max_pairs_per_request
    }

    pub fn prompt(pairs: &[ScanPair]) -> String {
        let mut out = String::from(
            "Per ciascuna coppia qui sotto, indica se la parola derivata ha un legame \
morfologico reale con il sostantivo indicato (stessa radice, derivazione esistente in italiano).\n\
Formato delle righe: id: 'parola derivata' (categoria) ← 'sostantivo'\n\n",
        );
        for pair in pairs {
            out.push_str(&format!(
                "{}: '{}' ({}) ← '{}'\n",
                pair.derived_form_id,
                pair.form,
                pair.pos.label_it(),
                pair.noun
            ));
        }
        out.push_str(
            "\nRispondi solo con JSON, una voce per ogni id, ad esempio:\n\
{\"17\": {\"valid\": true, \"reason\": \"breve motivazione\"}}",
        );
        out
    }

    /// Split pairs into batches and render one request per batch.
    pub fn build(&self, pairs: &[ScanPair]) -> (Vec<ScanBatch>, Vec<BatchRequestLine>) {
        pairs
            .chunks(self.max_pairs_per_request)
            .enumerate()
            .map(|(idx, chunk)| {
                let custom_id = format!("{SCAN_ID_PREFIX}{idx:05}");
                let pair_ids: Vec<DerivedFormId> = chunk.iter().map(|p| p.derived_form_id).collect();
                let mut line = BatchRequestLine::new(
                    custom_id.clone(),
                    BatchKind::Scan,
                    Self::prompt(chunk),
                    self.temperature,
                )
                .with_model(self.model.clone());
                line.pair_ids = pair_ids.clone();
                (ScanBatch { custom_id, pair_ids }, line)
            })
            .unzip()
    }

    pub async fn submit(&self, service: &dyn BatchService, pairs: Vec<ScanPair>) -> Result<ScanJob, BatchError> {
        let (batches, lines) = self.build(&pairs);
        let job_id = service.submit(BatchKind::Scan, lines).await?;
        tracing::info!(job = %job_id, pairs = pairs.len(), batches = batches.len(), "scan submitted");
        Ok(ScanJob {
            version: SCAN_JOB_VERSION.to_string(),
            job_id,
            submitted_at: Utc::now(),
            batches,
            pairs,
        })
    }

    pub async fn poll(&self, service: &dyn BatchService, job: &ScanJob) -> Result<BatchStatus, BatchError> {
        service.poll(&job.job_id).await
    }

    pub async fn retrieve(&self, service: &dyn BatchService, job: &ScanJob) -> Result<ScanOutcome, BatchError> {
        if job.batches.is_empty() {
            return Ok(ScanOutcome::default());
        }
        let results = service.retrieve(&job.job_id).await?;
        Ok(Self::collect(job, &results))
    }

    /// Reconcile raw results with what was submitted.
    pub fn collect(job: &ScanJob, results: &[BatchResultLine]) -> ScanOutcome {
        let submitted: HashSet<&str> = job.batches.iter().map(|b| b.custom_id.as_str()).collect();

        // Duplicate ids: prefer a line that carries content.
        let mut by_id: HashMap<&str, &BatchResultLine> = HashMap::new();
        for result in results {
            if !submitted.contains(result.custom_id.as_str()) {
                tracing::debug!(custom_id = %result.custom_id, job = %job.job_id, "ignoring result for unknown request");
                continue;
            }
            by_id
                .entry(result.custom_id.as_str())
                .and_modify(|existing| {
                    if existing.text().is_none() {
                        *existing = result;
                    }
                })
                .or_insert(result);
        }

        let pairs: HashMap<DerivedFormId, &ScanPair> =
            job.pairs.iter().map(|p| (p.derived_form_id, p)).collect();
        let mut outcome = ScanOutcome::default();

        for batch in &job.batches {
            let Some(result) = by_id.get(batch.custom_id.as_str()) else {
                outcome.unanswered.push(batch.clone());
                continue;
            };

            let verdicts = match result.text() {
                Some(text) => parse_verdicts(text),
                None => Err(result
                    .error
                    .clone()
                    .unwrap_or_else(|| "empty response".to_string())),
            };
            let verdicts = verdicts.and_then(|v| {
                let missing = batch.pair_ids.iter().filter(|id| !v.contains_key(*id)).count();
                if missing == 0 {
                    Ok(v)
                } else {
                    Err(format!(
                        "no verdict for {missing} of {} pairs",
                        batch.pair_ids.len()
                    ))
                }
            });

            match verdicts {
                Ok(verdicts) => {
                    outcome.judged += batch.pair_ids.len();
                    for id in &batch.pair_ids {
                        let (Some(verdict), Some(pair)) = (verdicts.get(id), pairs.get(id)) else {
                            continue;
                        };
                        if !verdict.valid {
                            outcome.flags.push(FlaggedPair {
                                pair: (*pair).clone(),
                                reason: verdict
                                    .reason
                                    .clone()
                                    .unwrap_or_else(|| DEFAULT_REASON.to_string()),
                            });
                        }
                    }
                }
                Err(reason) => {
                    tracing::warn!(custom_id = %batch.custom_id, pairs = batch.pair_ids.len(), %reason, "scan batch failed");
                    outcome.failed_batches.push(BatchFailure {
                        custom_id: batch.custom_id.clone(),
                        pair_ids: batch.pair_ids.clone(),
                        reason,
                    });
                }
            }
        }

        outcome.flags.sort_by_key(|f| f.pair.derived_form_id);
        tracing::info!(
            job = %job.job_id,
            judged = outcome.judged,
            flagged = outcome.flags.len(),
            failed = outcome.failed_batches.len(),
            unanswered = outcome.unanswered.len(),
            "scan collected"
        );
        outcome
    }
}

// ============================================================================
// Verdict parsing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
struct Verdict {
    valid: bool,
    reason: Option<String>,
}

/// Verdicts keyed by id. Entries that cannot be read are left out, which the
/// caller sees as a missing verdict.
fn parse_verdicts(text: &str) -> Result<HashMap<DerivedFormId, Verdict>, String> {
    let value = extract_json_object(text).map_err(|e| e.to_string())?;
    let mut root = &value;
    for wrapper in ["verdicts", "results", "risultati"] {
        if let Some(inner) = value.get(wrapper).filter(|v| v.is_object() || v.is_array()) {
            root = inner;
            break;
        }
    }

    let mut verdicts = HashMap::new();
    match root {
        Value::Object(map) => {
            for (key, raw) in map {
                if let (Ok(id), Some(verdict)) = (key.trim().parse::<DerivedFormId>(), read_verdict(raw)) {
                    verdicts.insert(id, verdict);
                }
            }
        }
        Value::Array(items) => {
            for item in items {
                let id = match &item["id"] {
                    Value::Number(n) => n.as_u64(),
                    Value::String(s) => s.trim().parse().ok(),
                    _ => None,
                };
                if let (Some(id), Some(verdict)) = (id, read_verdict(item)) {
                    verdicts.insert(id, verdict);
                }
            }
        }
        _ => return Err("verdicts are neither an object nor a list".to_string()),
    }
    Ok(verdicts)
}

fn read_verdict(raw: &Value) -> Option<Verdict> {
    match raw {
        Value::Bool(valid) => Some(Verdict {
            valid: *valid,
            reason: None,
        }),
        Value::String(s) => yes_no(s).map(|valid| Verdict { valid, reason: None }),
        Value::Object(map) => {
            let valid = ["valid", "valido", "plausible", "answer", "risposta"]
                .iter()
                .find_map(|k| match map.get(*k)? {
                    Value::Bool(b) => Some(*b),
                    Value::String(s) => yes_no(s),
                    _ => None,
                })?;
            let reason = ["reason", "motivo", "motivazione"]
                .iter()
                .find_map(|k| map.get(*k).and_then(Value::as_str))
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string);
            Some(Verdict { valid, reason })
        }
        _ => None,
    }
}

fn yes_no(answer: &str) -> Option<bool> {
    let lowered = answer.trim().to_lowercase();
    let word = lowered
        .split(|c: char| !c.is_alphabetic())
        .find(|w| !w.is_empty())?;
    match word {
        "sì" | "si" | "yes" | "true" | "valid" | "valido" => Some(true),
        "no" | "false" | "invalid" | "invalido" => Some(false),
        _ => None,
    }
}
