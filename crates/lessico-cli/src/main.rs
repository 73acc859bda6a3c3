//! Lessico CLI
//!
//! Command-line driver for the derivation pipeline:
//! - extracting nouns from a raw lexicon
//! - generating and filtering derived forms (direct or batch)
//! - scanning stored relations for suspicious pairs (submit / status / retrieve)
//! - human review, deletion scripts, and their manual application

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use lessico_lexicon::{read_noun_list, write_noun_list, FrequencyIndex, LemmaExtractor};
use lessico_llm::{
    review_and_emit, BatchService, BatchStatus, ConsoleReviewer, DerivationPipeline,
    FileBatchService, GenerationJob, GenerationReport, LLMProvider, PipelineConfig, RejectAll,
    ReviewDecider, RunLedger, ScanJob, ScanOutcome,
};
use lessico_storage::{DeletionScript, DerivationStore};

#[derive(Parser)]
#[command(name = "lessico")]
#[command(author, version, about = "Lessico: Italian morphological-derivation database")]
struct Cli {
    /// Pipeline configuration (JSON); flags override individual fields
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// More log output (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Extract candidate nouns from a `lemma<TAB>pos` lexicon.
    Extract {
        /// Lexicon file
        #[arg(long)]
        lexicon: PathBuf,
        /// Output noun list, one lemma per line
        #[arg(short, long)]
        out: PathBuf,
    },

    /// Generate derived forms for a noun list by calling the model directly.
    Generate {
        /// Noun list (from `extract`)
        #[arg(long)]
        nouns: PathBuf,
        /// Corpus frequency list (`lemma,frequency`)
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        ledger: Option<PathBuf>,
        /// Process these nouns again even if already done
        #[arg(long)]
        rerequest: Vec<String>,
        /// Concurrent model requests
        #[arg(long)]
        concurrency: Option<usize>,
    },

    /// Generate derived forms through a batch job.
    GenerateBatch {
        #[command(subcommand)]
        command: GenerateBatchCommands,
    },

    /// Re-judge stored relations with the model.
    Scan {
        #[command(subcommand)]
        command: ScanCommands,
    },

    /// Review scan flags and write a deletion script for rejected relations.
    Review {
        /// Flags file (from `scan retrieve`)
        #[arg(long)]
        flags: PathBuf,
        #[arg(long)]
        store: Option<PathBuf>,
        /// Deletion script to write
        #[arg(short, long)]
        out: PathBuf,
        /// Reject every flag without asking
        #[arg(long)]
        yes: bool,
    },

    /// Apply a reviewed deletion script to the store.
    ApplyDeletions {
        #[arg(long)]
        script: PathBuf,
        #[arg(long)]
        store: Option<PathBuf>,
    },

    /// Print store statistics.
    Stats {
        #[arg(long)]
        store: Option<PathBuf>,
        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Fold the write-ahead log into a fresh snapshot.
    Checkpoint {
        #[arg(long)]
        store: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum GenerateBatchCommands {
    /// Write a batch input file for the pending nouns.
    Submit {
        #[arg(long)]
        nouns: PathBuf,
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        batch_dir: Option<PathBuf>,
        #[arg(long)]
        rerequest: Vec<String>,
    },
    /// Apply the results of a finished generation batch.
    Collect {
        /// Job file written by `submit`
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        corpus: PathBuf,
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        ledger: Option<PathBuf>,
        #[arg(long)]
        batch_dir: Option<PathBuf>,
    },
}

#[derive(Subcommand)]
enum ScanCommands {
    /// Write a scan batch for every stored relation.
    Submit {
        #[arg(long)]
        store: Option<PathBuf>,
        #[arg(long)]
        batch_dir: Option<PathBuf>,
        /// Pairs per judgment request
        #[arg(long)]
        max_pairs: Option<usize>,
        /// Rescan only the failed and unanswered pairs of an earlier scan
        /// (its flags file from `scan retrieve`)
        #[arg(long)]
        only: Option<PathBuf>,
    },
    /// Report whether a scan batch has results.
    Status {
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        batch_dir: Option<PathBuf>,
    },
    /// Collect a finished scan into a flags file.
    Retrieve {
        #[arg(long)]
        job: PathBuf,
        #[arg(long)]
        batch_dir: Option<PathBuf>,
        #[arg(short, long)]
        out: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose, cli.quiet);

    let mut config = match &cli.config {
        Some(path) => PipelineConfig::load(path)?,
        None => PipelineConfig::default(),
    };

    match cli.command {
        Commands::Extract { lexicon, out } => cmd_extract(&lexicon, &out),
        Commands::Generate {
            nouns,
            corpus,
            store,
            ledger,
            rerequest,
            concurrency,
        } => {
            override_path(&mut config.store_dir, store);
            override_path(&mut config.ledger_path, ledger);
            if let Some(n) = concurrency {
                config.max_concurrent_requests = n;
            }
            cmd_generate(config, &nouns, &corpus, &rerequest).await
        }
        Commands::GenerateBatch { command } => match command {
            GenerateBatchCommands::Submit {
                nouns,
                ledger,
                batch_dir,
                rerequest,
            } => {
                override_path(&mut config.ledger_path, ledger);
                override_path(&mut config.batch_dir, batch_dir);
                cmd_generate_batch_submit(config, &nouns, &rerequest).await
            }
            GenerateBatchCommands::Collect {
                job,
                corpus,
                store,
                ledger,
                batch_dir,
            } => {
                override_path(&mut config.store_dir, store);
                override_path(&mut config.ledger_path, ledger);
                override_path(&mut config.batch_dir, batch_dir);
                cmd_generate_batch_collect(config, &job, &corpus).await
            }
        },
        Commands::Scan { command } => match command {
            ScanCommands::Submit {
                store,
                batch_dir,
                max_pairs,
                only,
            } => {
                override_path(&mut config.store_dir, store);
                override_path(&mut config.batch_dir, batch_dir);
                if let Some(n) = max_pairs {
                    config.max_pairs_per_request = n;
                }
                cmd_scan_submit(config, only.as_deref()).await
            }
            ScanCommands::Status { job, batch_dir } => {
                override_path(&mut config.batch_dir, batch_dir);
                cmd_scan_status(config, &job).await
            }
            ScanCommands::Retrieve { job, batch_dir, out } => {
                override_path(&mut config.batch_dir, batch_dir);
                cmd_scan_retrieve(config, &job, &out).await
            }
        },
        Commands::Review {
            flags,
            store,
            out,
            yes,
        } => {
            override_path(&mut config.store_dir, store);
            cmd_review(config, &flags, &out, yes)
        }
        Commands::ApplyDeletions { script, store } => {
            override_path(&mut config.store_dir, store);
            cmd_apply_deletions(config, &script)
        }
        Commands::Stats { store, json } => {
            override_path(&mut config.store_dir, store);
            cmd_stats(config, json)
        }
        Commands::Checkpoint { store } => {
            override_path(&mut config.store_dir, store);
            let store = open_store(&config)?;
            store.checkpoint()?;
            eprintln!("{} {}", "checkpointed".green().bold(), config.store_dir.display());
            Ok(())
        }
    }
}

fn init_logging(verbose: u8, quiet: bool) {
    let level = if quiet {
        tracing::Level::ERROR
    } else {
        match verbose {
            0 => tracing::Level::WARN,
            1 => tracing::Level::INFO,
            2 => tracing::Level::DEBUG,
            _ => tracing::Level::TRACE,
        }
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn override_path(slot: &mut PathBuf, value: Option<PathBuf>) {
    if let Some(v) = value {
        *slot = v;
    }
}

fn open_store(config: &PipelineConfig) -> Result<DerivationStore> {
    DerivationStore::open(&config.store_dir)
        .with_context(|| format!("opening store {}", config.store_dir.display()))
}

fn open_ledger(config: &PipelineConfig, rerequest: &[String]) -> Result<RunLedger> {
    let mut ledger = RunLedger::load(&config.ledger_path)?;
    for lemma in rerequest {
        ledger.rerequest(lemma);
    }
    Ok(ledger)
}

/// Only a missing or unreadable corpus is fatal. An empty index rejects
/// every proposal.
fn load_index(corpus: &Path) -> Result<FrequencyIndex> {
    let index = FrequencyIndex::open(corpus)?;
    if index.is_empty() {
        let stats = index.stats();
        tracing::warn!(
            path = %corpus.display(),
            kept = stats.kept,
            below_threshold = stats.below_threshold,
            malformed = stats.malformed,
            "frequency index is empty; no proposal can pass the filter"
        );
    }
    Ok(index)
}

fn load_nouns(path: &Path) -> Result<Vec<String>> {
    read_noun_list(path).with_context(|| format!("reading noun list {}", path.display()))
}

#[cfg(any(
    feature = "llm-mistral",
    feature = "llm-openai",
    feature = "llm-anthropic",
    feature = "llm-local"
))]
fn provider_from_env() -> Result<Arc<dyn LLMProvider>> {
    let client = lessico_llm::llm::providers::UnifiedClient::from_env()?;
    Ok(Arc::new(client))
}

#[cfg(not(any(
    feature = "llm-mistral",
    feature = "llm-openai",
    feature = "llm-anthropic",
    feature = "llm-local"
)))]
fn provider_from_env() -> Result<Arc<dyn LLMProvider>> {
    bail!("this build has no model providers; enable one of the `llm-*` features")
}

/// Batch jobs only need a provider to render prompts, never to call it.
fn offline_provider() -> Arc<dyn LLMProvider> {
    Arc::new(lessico_llm::MockProvider::new(Vec::new()))
}

fn job_file(config: &PipelineConfig, job_id: &impl std::fmt::Display) -> PathBuf {
    config.batch_dir.join(format!("{job_id}.job.json"))
}

// ============================================================================
// Commands
// ============================================================================

fn cmd_extract(lexicon: &Path, out: &Path) -> Result<()> {
    println!("{} {}", "Extracting".green().bold(), lexicon.display());
    let report = LemmaExtractor::new().extract_file(lexicon)?;
    write_noun_list(out, &report.nouns)?;

    println!("  {} {} nouns", "→".yellow(), report.nouns.len());
    println!(
        "  {} {} malformed, {} not nouns, {} rejected, {} duplicates",
        "→".yellow(),
        report.malformed_lines,
        report.not_nouns,
        report.rejected,
        report.duplicates
    );
    eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
    Ok(())
}

async fn cmd_generate(config: PipelineConfig, nouns: &Path, corpus: &Path, rerequest: &[String]) -> Result<()> {
    let nouns = load_nouns(nouns)?;
    let index = load_index(corpus)?;
    let store = open_store(&config)?;
    let mut ledger = open_ledger(&config, rerequest)?;
    let provider = provider_from_env()?;

    println!(
        "{} {} nouns (model {}, {} concurrent requests)",
        "Generating".green().bold(),
        nouns.len(),
        provider.model_info().name,
        config.max_concurrent_requests
    );
    let pipeline = DerivationPipeline::new(&store, &index, provider, config.clone());
    let report = pipeline.run_generation(&nouns, &mut ledger).await?;
    store.checkpoint()?;
    print_generation_report(&report);
    Ok(())
}

async fn cmd_generate_batch_submit(config: PipelineConfig, nouns: &Path, rerequest: &[String]) -> Result<()> {
    let nouns = load_nouns(nouns)?;
    let ledger = open_ledger(&config, rerequest)?;
    // Submission does not touch the store or the corpus.
    let store = DerivationStore::in_memory();
    let index = FrequencyIndex::default();
    let service = FileBatchService::new(&config.batch_dir);

    let pipeline = DerivationPipeline::new(&store, &index, offline_provider(), config.clone());
    let job = pipeline.submit_generation_batch(&service, &nouns, &ledger).await?;
    let path = job_file(&config, &job.job_id);
    job.save(&path)?;

    println!("{} {} nouns", "Submitted".green().bold(), job.lemmas.len());
    println!("  {} upload {}", "→".yellow(), service.input_path(&job.job_id).display());
    println!("  {} results go to {}", "→".yellow(), service.output_path(&job.job_id).display());
    eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
    Ok(())
}

async fn cmd_generate_batch_collect(config: PipelineConfig, job: &Path, corpus: &Path) -> Result<()> {
    let job = GenerationJob::load(job)?;
    let service = FileBatchService::new(&config.batch_dir);
    if service.poll(&job.job_id).await? == BatchStatus::Pending {
        bail!(
            "batch {} has no results yet; expected {}",
            job.job_id,
            service.output_path(&job.job_id).display()
        );
    }

    let index = load_index(corpus)?;
    let store = open_store(&config)?;
    let mut ledger = open_ledger(&config, &[])?;
    let pipeline = DerivationPipeline::new(&store, &index, offline_provider(), config.clone());
    let report = pipeline
        .collect_generation_batch(&service, &job, &mut ledger)
        .await?;
    store.checkpoint()?;
    print_generation_report(&report);
    Ok(())
}

fn print_generation_report(report: &GenerationReport) {
    println!(
        "  {} {} processed, {} already done, {} failed",
        "→".yellow(),
        report.processed,
        report.already_processed,
        report.failed.len()
    );
    println!(
        "  {} {} proposals: {} attested, {} not in corpus, {} new rows",
        "→".yellow(),
        report.proposals,
        report.accepted,
        report.rejected,
        report.inserted
    );
    if !report.unanswered.is_empty() {
        println!(
            "  {} {} nouns had no result and stay pending",
            "info:".yellow().bold(),
            report.unanswered.len()
        );
    }
    for (lemma, reason) in report.failed.iter().take(10) {
        println!("    {} {lemma}: {reason}", "skipped".red());
    }
}

async fn cmd_scan_submit(config: PipelineConfig, only: Option<&Path>) -> Result<()> {
    let store = open_store(&config)?;
    let index = FrequencyIndex::default();
    let service = FileBatchService::new(&config.batch_dir);
    let pipeline = DerivationPipeline::new(&store, &index, offline_provider(), config.clone());

    let job = match only {
        Some(previous) => {
            let ids = ScanOutcome::load(previous)?.retry_pair_ids();
            if ids.is_empty() {
                println!("{} nothing to rescan in {}", "info:".yellow().bold(), previous.display());
                return Ok(());
            }
            pipeline.submit_rescan(&service, &ids).await?
        }
        None => pipeline.submit_scan(&service).await?,
    };
    let path = job_file(&config, &job.job_id);
    job.save(&path)?;

    println!(
        "{} {} pairs in {} requests",
        "Submitted scan".green().bold(),
        job.pairs.len(),
        job.batches.len()
    );
    println!("  {} upload {}", "→".yellow(), service.input_path(&job.job_id).display());
    eprintln!("{} {}", "wrote".green().bold(), path.display().to_string().bold());
    Ok(())
}

async fn cmd_scan_status(config: PipelineConfig, job: &Path) -> Result<()> {
    let job = ScanJob::load(job)?;
    let service = FileBatchService::new(&config.batch_dir);
    match service.poll(&job.job_id).await? {
        BatchStatus::Pending => println!(
            "{} {} (submitted {}, waiting for {})",
            "pending".yellow().bold(),
            job.job_id,
            job.submitted_at.format("%Y-%m-%d %H:%M"),
            service.output_path(&job.job_id).display()
        ),
        BatchStatus::Completed => println!("{} {}", "completed".green().bold(), job.job_id),
    }
    Ok(())
}

async fn cmd_scan_retrieve(config: PipelineConfig, job: &Path, out: &Path) -> Result<()> {
    let job = ScanJob::load(job)?;
    let service = FileBatchService::new(&config.batch_dir);
    let outcome = config.scanner().retrieve(&service, &job).await?;
    outcome.save(out)?;

    println!(
        "{} {} judged, {} flagged",
        "Scan".green().bold(),
        outcome.judged,
        outcome.flags.len()
    );
    if !outcome.failed_batches.is_empty() || !outcome.unanswered.is_empty() {
        println!(
            "  {} {} failed and {} unanswered requests ({} pairs to rescan)",
            "info:".yellow().bold(),
            outcome.failed_batches.len(),
            outcome.unanswered.len(),
            outcome.retry_pair_ids().len()
        );
        println!(
            "  {} rescan them with `lessico scan submit --only {}`",
            "→".yellow(),
            out.display()
        );
    }
    eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
    Ok(())
}

fn cmd_review(config: PipelineConfig, flags: &Path, out: &Path, yes: bool) -> Result<()> {
    let outcome = ScanOutcome::load(flags)?;
    let store = open_store(&config)?;

    let mut console;
    let mut reject_all = RejectAll;
    let decider: &mut dyn ReviewDecider = if yes {
        &mut reject_all
    } else {
        console = ConsoleReviewer::stdio();
        &mut console
    };

    let (summary, script) = review_and_emit(&outcome, &store, decider);
    script
        .write_to(out)
        .with_context(|| format!("writing {}", out.display()))?;

    println!(
        "{} {} rejected, {} kept, {} already gone",
        "Reviewed".green().bold(),
        summary.rejected_ids.len(),
        summary.confirmed,
        summary.skipped_missing
    );
    println!(
        "  {} nothing is deleted until you run `lessico apply-deletions --script {}`",
        "→".yellow(),
        out.display()
    );
    eprintln!("{} {}", "wrote".green().bold(), out.display().to_string().bold());
    Ok(())
}

fn cmd_apply_deletions(config: PipelineConfig, script: &Path) -> Result<()> {
    let script = DeletionScript::read_from(script)?;
    let store = open_store(&config)?;
    let report = store.apply_deletion_script(&script)?;
    store.checkpoint()?;
    println!(
        "{} {} removed, {} already absent",
        "Applied".green().bold(),
        report.removed.len(),
        report.already_absent.len()
    );
    Ok(())
}

fn cmd_stats(config: PipelineConfig, json: bool) -> Result<()> {
    let store = open_store(&config)?;
    let stats = store.stats();
    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }
    println!("{} {}", "Store".green().bold(), config.store_dir.display());
    println!("  words:           {}", stats.words);
    println!("  derived forms:   {}", stats.derived_forms);
    for (pos, count) in &stats.by_pos {
        println!("    {:<13} {}", pos.label_it(), count);
    }
    println!("  without derivations: {}", stats.nouns_without_derivations);
    Ok(())
}
