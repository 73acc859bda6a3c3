//! End-to-end tests across the lexicon, storage and model crates.

use std::sync::Arc;

use lessico_lexicon::{FrequencyIndex, LemmaExtractor, PartOfSpeech};
use lessico_llm::{
    review_and_emit, BatchResultLine, BatchService, BatchStatus, DerivationPipeline,
    FileBatchService, FnProvider, InlineBatchService, LLMError, PipelineConfig, RejectAll,
    RunLedger, ScanJob, ScanOutcome, SuspicionScanner,
};
use lessico_storage::{DeletionScript, DerivationStore};
use tempfile::tempdir;

fn config() -> PipelineConfig {
    PipelineConfig {
        max_retries: 0,
        retry_backoff_ms: 1,
        ..PipelineConfig::default()
    }
}

fn generation_oracle(prompt: &str) -> Result<String, LLMError> {
    let lemma = prompt.lines().last().unwrap_or("").trim();
    match lemma {
        "gatto" => Ok(r#"{"gatto": {"morpho": {"a": ["gattino", "xyzqq"], "r": "N/A", "v": "N/A"}}}"#.to_string()),
        _ => Ok(format!(r#"{{"{lemma}": {{"morpho": {{"a": "N/A", "r": "N/A", "v": "N/A"}}}}}}"#)),
    }
}

/// Flags every relation whose form is `gattino`.
fn scan_oracle(prompt: &str) -> Result<String, LLMError> {
    let mut verdicts = serde_json::Map::new();
    for line in prompt.lines() {
        if let Some((id, rest)) = line.split_once(": '") {
            if let Ok(id) = id.trim().parse::<u64>() {
                let valid = !rest.starts_with("gattino'");
                verdicts.insert(id.to_string(), serde_json::json!({ "valid": valid, "reason": "diminutivo" }));
            }
        }
    }
    Ok(serde_json::Value::Object(verdicts).to_string())
}

#[tokio::test]
async fn test_full_pipeline_scenario() {
    let dir = tempdir().unwrap();
    let store_dir = dir.path().join("store");

    // Extraction: only "gatto" survives.
    let extraction = LemmaExtractor::new().extract_text("gatto\tn\ncasa123\tn\na\tn\n");
    assert_eq!(extraction.nouns, vec!["gatto".to_string()]);

    // Generation + filter: "xyzqq" is not attested.
    let index = FrequencyIndex::parse("gattino,12\n");
    {
        let store = DerivationStore::open(&store_dir).unwrap();
        let pipeline = DerivationPipeline::new(
            &store,
            &index,
            Arc::new(FnProvider::new(generation_oracle)),
            config(),
        );
        let mut ledger = RunLedger::in_memory();
        let report = pipeline.run_generation(&extraction.nouns, &mut ledger).await.unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
    }

    // Reopen from the WAL.
    let store = DerivationStore::open(&store_dir).unwrap();
    let gatto = store.word_by_lemma("gatto").unwrap();
    let forms = store.derived_forms_of(gatto.id);
    assert_eq!(forms.len(), 1);
    assert_eq!(forms[0].form, "gattino");
    assert_eq!(forms[0].pos, PartOfSpeech::Adjective);

    // Scan: gattino is flagged.
    let service = InlineBatchService::new(Arc::new(FnProvider::new(scan_oracle)), 2);
    let scanner = SuspicionScanner::new(25);
    let job = scanner.submit(&service, store.scan_pairs()).await.unwrap();
    let outcome = scanner.retrieve(&service, &job).await.unwrap();
    assert_eq!(outcome.flags.len(), 1);
    assert_eq!(outcome.flags[0].pair.derived_form_id, forms[0].id);

    // Review rejects it; the script has one statement.
    let (summary, script) = review_and_emit(&outcome, &store, &mut RejectAll);
    assert_eq!(summary.rejected_ids, vec![forms[0].id]);
    assert_eq!(script.len(), 1);
    let script_path = dir.path().join("deletions.sql");
    script.write_to(&script_path).unwrap();

    // The pipeline never applied it.
    assert_eq!(store.derived_form_count(), 1);

    // Manual application, twice.
    let reread = DeletionScript::read_from(&script_path).unwrap();
    let first = store.apply_deletion_script(&reread).unwrap();
    let second = store.apply_deletion_script(&reread).unwrap();
    assert_eq!(first.removed.len(), 1);
    assert!(second.removed.is_empty());
    assert_eq!(store.derived_form_count(), 0);
    assert_eq!(store.word_count(), 1);
}

#[tokio::test]
async fn test_file_batch_scan_survives_process_boundary() {
    let dir = tempdir().unwrap();
    let batch_dir = dir.path().join("batches");

    let store = DerivationStore::in_memory();
    let gatto = store.add_word("gatto").unwrap();
    let casa = store.add_word("casa").unwrap();
    let gattino = store
        .add_derived_form(gatto.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    let casalingo = store
        .add_derived_form(casa.id, "casalingo", PartOfSpeech::Adjective)
        .unwrap();

    // Submit, one pair per request, and persist the job.
    let job_path = dir.path().join("job.json");
    {
        let service = FileBatchService::new(&batch_dir);
        let job = SuspicionScanner::new(1)
            .submit(&service, store.scan_pairs())
            .await
            .unwrap();
        assert_eq!(job.batches.len(), 2);
        job.save(&job_path).unwrap();
        assert_eq!(service.poll(&job.job_id).await.unwrap(), BatchStatus::Pending);
    }

    // Later: the operator drops results for only one request, out of order,
    // plus a line for a request that was never made.
    let job = ScanJob::load(&job_path).unwrap();
    let service = FileBatchService::new(&batch_dir);
    let gattino_batch = job
        .batches
        .iter()
        .find(|b| b.pair_ids == vec![gattino.id])
        .unwrap();
    let lines = [
        serde_json::json!({"custom_id": "scan-99999", "content": "{}"}),
        serde_json::json!({
            "custom_id": gattino_batch.custom_id,
            "response": {"body": {"choices": [{"message": {"content":
                format!(r#"{{"{}": {{"valid": false, "reason": "diminutivo"}}}}"#, gattino.id)}}]}}
        }),
    ];
    let text: String = lines.iter().map(|l| format!("{l}\n")).collect();
    std::fs::write(service.output_path(&job.job_id), text).unwrap();

    let outcome = SuspicionScanner::new(1).retrieve(&service, &job).await.unwrap();
    assert_eq!(outcome.flags.len(), 1);
    assert_eq!(outcome.flags[0].pair.form, "gattino");
    assert_eq!(outcome.unanswered.len(), 1);
    assert_eq!(outcome.unanswered[0].pair_ids, vec![casalingo.id]);
    assert!(outcome.failed_batches.is_empty());

    // The flags file round-trips for the review step.
    let flags_path = dir.path().join("flags.json");
    outcome.save(&flags_path).unwrap();
    let reloaded = ScanOutcome::load(&flags_path).unwrap();
    assert_eq!(reloaded, outcome);
}

#[tokio::test]
async fn test_batch_generation_matches_direct_generation() {
    let index = FrequencyIndex::parse("gattino,12\n");
    let nouns = vec!["gatto".to_string(), "casa".to_string()];

    let direct = DerivationStore::in_memory();
    DerivationPipeline::new(&direct, &index, Arc::new(FnProvider::new(generation_oracle)), config())
        .run_generation(&nouns, &mut RunLedger::in_memory())
        .await
        .unwrap();

    let batched = DerivationStore::in_memory();
    let pipeline = DerivationPipeline::new(
        &batched,
        &index,
        Arc::new(FnProvider::new(generation_oracle)),
        config(),
    );
    let service = InlineBatchService::new(Arc::new(FnProvider::new(generation_oracle)), 2);
    let mut ledger = RunLedger::in_memory();
    let job = pipeline
        .submit_generation_batch(&service, &nouns, &ledger)
        .await
        .unwrap();
    let report = pipeline
        .collect_generation_batch(&service, &job, &mut ledger)
        .await
        .unwrap();
    assert_eq!(report.processed, 2);

    let pairs = |store: &DerivationStore| -> Vec<(String, String)> {
        store
            .scan_pairs()
            .into_iter()
            .map(|p| (p.noun, p.form))
            .collect()
    };
    assert_eq!(pairs(&direct), pairs(&batched));
    assert_eq!(direct.word_count(), batched.word_count());

    // Results with unknown ids are ignored.
    let extra = [BatchResultLine::ok("gen-cane", "{}")];
    let again = pipeline
        .ingest_generation_results(&job, &extra, &mut ledger)
        .unwrap();
    assert_eq!(again.processed, 0);
    assert_eq!(again.unanswered.len(), 2);
}
