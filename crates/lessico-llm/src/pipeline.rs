//! Generation pipeline: nouns in, stored derivations out.
//!
//! ```text
//! nouns ──► RunLedger::pending ──► CandidateGenerator (concurrent)
//!                                        │
//!            DerivationStore ◄── CandidateFilter ◄── results, in input order
//! ```
//!
//! Model calls run concurrently; their results are applied by one writer in
//! input order, `add_word` before any `add_derived_form`. Oracle failures
//! skip the noun and are recorded in the ledger. Store errors abort.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lessico_lexicon::{is_valid_lemma, normalize, CandidateProposal, FrequencyIndex};
use lessico_storage::{DerivationStore, DerivedFormId, StoreError};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::batch::{BatchError, BatchJobId, BatchKind, BatchResultLine, BatchService, BatchStatus};
use crate::filter::{CandidateFilter, FilterStats};
use crate::generator::{CandidateGenerator, GenerationError};
use crate::ledger::{LedgerError, RunLedger};
use crate::llm::{LLMProvider, RetryPolicy};
use crate::review::{review, ReviewDecider, ReviewSummary};
use crate::scanner::{ScanJob, ScanOutcome, SuspicionScanner};
use lessico_storage::{DeletionScript, DeletionScriptEmitter};

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Batch(#[from] BatchError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error("cannot load pipeline config {path}: {reason}")]
    Config { path: String, reason: String },
}

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_requests: usize,
    pub max_pairs_per_request: usize,
    pub temperature: f32,
    pub max_retries: u32,
    pub retry_backoff_ms: u64,
    /// Model name written into batch request bodies.
    pub batch_model: Option<String>,
    pub store_dir: PathBuf,
    pub ledger_path: PathBuf,
    pub batch_dir: PathBuf,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 6,
            max_pairs_per_request: 25,
            temperature: 0.7,
            max_retries: 5,
            retry_backoff_ms: 150,
            batch_model: None,
            store_dir: PathBuf::from("lessico-store"),
            ledger_path: PathBuf::from("lessico-ledger.json"),
            batch_dir: PathBuf::from("lessico-batches"),
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        let config_err = |reason: String| PipelineError::Config {
            path: path.display().to_string(),
            reason,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_err(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| config_err(e.to_string()))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            backoff: Duration::from_millis(self.retry_backoff_ms),
            ..RetryPolicy::default()
        }
    }

    pub fn generator(&self, provider: Arc<dyn LLMProvider>) -> CandidateGenerator {
        CandidateGenerator::new(provider)
            .with_temperature(self.temperature)
            .with_retry(self.retry_policy())
            .with_model(self.batch_model.clone())
    }

    pub fn scanner(&self) -> SuspicionScanner {
        SuspicionScanner::new(self.max_pairs_per_request).with_model(self.batch_model.clone())
    }
}

// ============================================================================
// Reports
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    /// Nouns that were pending at the start of the run.
    pub requested: usize,
    pub already_processed: usize,
    pub processed: usize,
    pub failed: Vec<(String, String)>,
    /// Submitted nouns with no result in a batch (left pending).
    pub unanswered: Vec<String>,
    pub proposals: usize,
    pub accepted: usize,
    pub rejected: usize,
    /// New derived-form rows (re-adding an existing triple does not count).
    pub inserted: usize,
}

impl GenerationReport {
    fn absorb(&mut self, stats: FilterStats) {
        self.accepted += stats.accepted;
        self.rejected += stats.rejected;
    }
}

/// A submitted batch generation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationJob {
    pub job_id: BatchJobId,
    pub submitted_at: DateTime<Utc>,
    pub lemmas: Vec<String>,
}

impl GenerationJob {
    pub fn save(&self, path: &Path) -> Result<(), BatchError> {
        std::fs::write(path, serde_json::to_string_pretty(self)?).map_err(|source| BatchError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn load(path: &Path) -> Result<Self, BatchError> {
        let text = std::fs::read_to_string(path).map_err(|source| BatchError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }
}

// ============================================================================
// Pipeline
// ============================================================================

pub struct DerivationPipeline<'a> {
    store: &'a DerivationStore,
    index: &'a FrequencyIndex,
    generator: CandidateGenerator,
    config: PipelineConfig,
}

impl<'a> DerivationPipeline<'a> {
    pub fn new(
        store: &'a DerivationStore,
        index: &'a FrequencyIndex,
        provider: Arc<dyn LLMProvider>,
        config: PipelineConfig,
    ) -> Self {
        Self {
            store,
            index,
            generator: config.generator(provider),
            config,
        }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Nouns handed to the model per round before results are written and
    /// the ledger is saved.
    fn window(&self) -> usize {
        self.config.max_concurrent_requests.max(1) * 8
    }

    /// Direct (non-batch) generation over `nouns`.
    pub async fn run_generation(
        &self,
        nouns: &[String],
        ledger: &mut RunLedger,
    ) -> Result<GenerationReport, PipelineError> {
        let pending = ledger.pending(nouns);
        let mut report = GenerationReport {
            requested: pending.len(),
            already_processed: nouns.len().saturating_sub(pending.len()),
            ..GenerationReport::default()
        };
        let (pending, unstorable) = split_storable(pending);
        for lemma in unstorable {
            tracing::warn!(lemma = %lemma, "not a storable lemma, not sent to the model");
            ledger.mark_failed(&lemma, INVALID_LEMMA);
            report.failed.push((lemma, INVALID_LEMMA.to_string()));
        }
        tracing::info!(pending = pending.len(), total = nouns.len(), "generation started");

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent_requests.max(1)));

        for window in pending.chunks(self.window()) {
            let mut tasks = JoinSet::new();
            for (idx, lemma) in window.iter().enumerate() {
                let generator = self.generator.clone();
                let semaphore = Arc::clone(&semaphore);
                let lemma = lemma.clone();
                tasks.spawn(async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    let result = generator.generate(&lemma).await;
                    (idx, result)
                });
            }

            let mut results: Vec<Option<Result<Vec<CandidateProposal>, GenerationError>>> =
                (0..window.len()).map(|_| None).collect();
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok((idx, result)) => results[idx] = Some(result),
                    Err(e) => tracing::warn!(error = %e, "generation task aborted"),
                }
            }

            // Single writer, input order.
            for (lemma, result) in window.iter().zip(results) {
                match result {
                    Some(result) => self.apply(lemma, result, ledger, &mut report)?,
                    None => {
                        ledger.mark_failed(lemma, "generation task aborted");
                        report.failed.push((lemma.clone(), "generation task aborted".to_string()));
                    }
                }
            }
            ledger.save()?;
        }

        tracing::info!(
            processed = report.processed,
            failed = report.failed.len(),
            accepted = report.accepted,
            rejected = report.rejected,
            inserted = report.inserted,
            "generation finished"
        );
        Ok(report)
    }

    /// Send pending nouns to a batch service instead of calling the model.
    pub async fn submit_generation_batch(
        &self,
        service: &dyn BatchService,
        nouns: &[String],
        ledger: &RunLedger,
    ) -> Result<GenerationJob, PipelineError> {
        let (lemmas, unstorable) = split_storable(ledger.pending(nouns));
        if !unstorable.is_empty() {
            tracing::warn!(skipped = unstorable.len(), "unstorable lemmas left out of the batch");
        }
        let lines = lemmas.iter().map(|l| self.generator.batch_request(l)).collect();
        let job_id = service.submit(BatchKind::Generation, lines).await?;
        tracing::info!(job = %job_id, nouns = lemmas.len(), "generation batch submitted");
        Ok(GenerationJob {
            job_id,
            submitted_at: Utc::now(),
            lemmas,
        })
    }

    pub async fn poll_generation_batch(
        &self,
        service: &dyn BatchService,
        job: &GenerationJob,
    ) -> Result<BatchStatus, PipelineError> {
        Ok(service.poll(&job.job_id).await?)
    }

    /// Retrieve a batch generation job and apply it.
    pub async fn collect_generation_batch(
        &self,
        service: &dyn BatchService,
        job: &GenerationJob,
        ledger: &mut RunLedger,
    ) -> Result<GenerationReport, PipelineError> {
        let results = service.retrieve(&job.job_id).await?;
        self.ingest_generation_results(job, &results, ledger)
    }

    /// Apply batch results, in the order the nouns were submitted.
    ///
    /// Results for nouns outside the job are ignored; nouns with no result
    /// stay pending.
    pub fn ingest_generation_results(
        &self,
        job: &GenerationJob,
        results: &[BatchResultLine],
        ledger: &mut RunLedger,
    ) -> Result<GenerationReport, PipelineError> {
        let mut by_lemma: std::collections::HashMap<&str, &BatchResultLine> = std::collections::HashMap::new();
        for result in results {
            match CandidateGenerator::lemma_from_custom_id(&result.custom_id) {
                Some(lemma) => {
                    by_lemma
                        .entry(lemma)
                        .and_modify(|existing| {
                            if existing.text().is_none() {
                                *existing = result;
                            }
                        })
                        .or_insert(result);
                }
                None => tracing::debug!(custom_id = %result.custom_id, "ignoring non-generation result"),
            }
        }

        let mut report = GenerationReport {
            requested: job.lemmas.len(),
            ..GenerationReport::default()
        };
        for lemma in &job.lemmas {
            let Some(result) = by_lemma.get(lemma.as_str()) else {
                report.unanswered.push(lemma.clone());
                continue;
            };
            let parsed = match result.text() {
                Some(text) => CandidateGenerator::parse_response(lemma, text),
                None => Err(GenerationError::Malformed {
                    lemma: lemma.clone(),
                    reason: result
                        .error
                        .clone()
                        .unwrap_or_else(|| "empty response".to_string()),
                }),
            };
            self.apply(lemma, parsed, ledger, &mut report)?;
        }
        ledger.save()?;

        if !report.unanswered.is_empty() {
            tracing::warn!(unanswered = report.unanswered.len(), job = %job.job_id, "nouns without a batch result stay pending");
        }
        tracing::info!(
            processed = report.processed,
            failed = report.failed.len(),
            inserted = report.inserted,
            "generation batch ingested"
        );
        Ok(report)
    }

    fn apply(
        &self,
        lemma: &str,
        result: Result<Vec<CandidateProposal>, GenerationError>,
        ledger: &mut RunLedger,
        report: &mut GenerationReport,
    ) -> Result<(), PipelineError> {
        let proposals = match result {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(lemma, error = %e, "skipping noun");
                ledger.mark_failed(lemma, e.to_string());
                report.failed.push((lemma.to_string(), e.to_string()));
                return Ok(());
            }
        };

        let word = match self.store.add_word(lemma) {
            Ok(word) => word,
            Err(StoreError::InvalidLemma(_)) => {
                tracing::warn!(lemma, "not a storable lemma, skipping");
                ledger.mark_failed(lemma, INVALID_LEMMA);
                report.failed.push((lemma.to_string(), INVALID_LEMMA.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        report.proposals += proposals.len();
        let (accepted, stats) = CandidateFilter::new(self.index).filter(proposals);
        report.absorb(stats);

        for proposal in accepted {
            let before = self.store.derived_form_count();
            self.store
                .add_derived_form(word.id, &proposal.proposed_form, proposal.pos)?;
            if self.store.derived_form_count() > before {
                report.inserted += 1;
            }
        }

        ledger.mark_processed(lemma);
        report.processed += 1;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Scan and review
    // ------------------------------------------------------------------

    /// Submit every stored relation for a suspicion scan.
    pub async fn submit_scan(&self, service: &dyn BatchService) -> Result<ScanJob, PipelineError> {
        let pairs = self.store.scan_pairs();
        Ok(self.config.scanner().submit(service, pairs).await?)
    }

    /// Submit only the listed relations, typically
    /// [`ScanOutcome::retry_pair_ids`] of an earlier scan. Ids no longer in
    /// the store are skipped.
    pub async fn submit_rescan(
        &self,
        service: &dyn BatchService,
        ids: &[DerivedFormId],
    ) -> Result<ScanJob, PipelineError> {
        let wanted: HashSet<DerivedFormId> = ids.iter().copied().collect();
        let pairs: Vec<_> = self
            .store
            .scan_pairs()
            .into_iter()
            .filter(|p| wanted.contains(&p.derived_form_id))
            .collect();
        if pairs.len() < wanted.len() {
            tracing::info!(missing = wanted.len() - pairs.len(), "relations already removed, not rescanned");
        }
        Ok(self.config.scanner().submit(service, pairs).await?)
    }

    pub async fn retrieve_scan(&self, service: &dyn BatchService, job: &ScanJob) -> Result<ScanOutcome, PipelineError> {
        Ok(self.config.scanner().retrieve(service, job).await?)
    }

    /// Review flags and turn the rejections into a deletion script.
    pub fn review_flags(
        &self,
        outcome: &ScanOutcome,
        decider: &mut dyn ReviewDecider,
    ) -> (ReviewSummary, DeletionScript) {
        review_and_emit(outcome, self.store, decider)
    }
}

const INVALID_LEMMA: &str = "invalid lemma";

/// Split nouns into those the store would accept as a Word and the rest.
fn split_storable(nouns: Vec<String>) -> (Vec<String>, Vec<String>) {
    nouns
        .into_iter()
        .partition(|lemma| is_valid_lemma(&normalize(lemma)))
}

/// Review flags against `store` and emit the script for the rejected ones.
pub fn review_and_emit(
    outcome: &ScanOutcome,
    store: &DerivationStore,
    decider: &mut dyn ReviewDecider,
) -> (ReviewSummary, DeletionScript) {
    let summary = review(&outcome.flags, store, decider);
    let script = DeletionScriptEmitter::new().emit(&summary.rejected_ids, store);
    (summary, script)
}
