//! Lessico model-driven stages
//!
//! The parts of the derivation pipeline that talk to a language model, plus
//! the plumbing around them:
//!
//! - [`llm`]: the narrow [`LLMProvider`] oracle trait, retries, JSON
//!   extraction, and (behind features) HTTP clients
//! - [`generator`]: ask for adjectives/adverbs/verbs derived from a noun
//! - [`filter`]: keep only corpus-attested proposals
//! - [`scanner`]: re-judge stored relations in batches and flag suspicious ones
//! - [`review`]: human confirmation of flags
//! - [`batch`]: submit / poll / retrieve batch jobs
//! - [`ledger`]: resumable generation runs
//! - [`pipeline`]: wiring, configuration, single-writer application
//!
//! ## Example
//!
//! ```ignore
//! use lessico_llm::*;
//!
//! let provider = std::sync::Arc::new(llm::providers::UnifiedClient::from_env()?);
//! let pipeline = DerivationPipeline::new(&store, &index, provider, PipelineConfig::default());
//! let report = pipeline.run_generation(&nouns, &mut ledger).await?;
//! ```

pub mod batch;
pub mod filter;
pub mod generator;
pub mod ledger;
pub mod llm;
pub mod mock;
pub mod pipeline;
pub mod review;
pub mod scanner;

pub use batch::{
    BatchError, BatchJobId, BatchKind, BatchRequestLine, BatchResultLine, BatchService, BatchStatus,
    FileBatchService, InlineBatchService,
};
pub use filter::{CandidateFilter, FilterStats};
pub use generator::{CandidateGenerator, GenerationError};
pub use ledger::{LedgerError, RunLedger};
pub use llm::{
    CompletionRequest, CompletionResponse, ConfigError, LLMConfig, LLMError, LLMProvider, Provider,
    RetryPolicy,
};
pub use mock::{FnProvider, MockProvider};
pub use pipeline::{
    review_and_emit, DerivationPipeline, GenerationJob, GenerationReport, PipelineConfig,
    PipelineError,
};
pub use review::{review, ConsoleReviewer, RejectAll, ReviewDecider, ReviewOutcome, ReviewSummary};
pub use scanner::{
    BatchFailure, FlaggedPair, ScanBatch, ScanJob, ScanOutcome, SuspicionFlag, SuspicionScanner,
};
