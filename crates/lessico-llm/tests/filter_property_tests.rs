//! Every derived form that reaches the store is attested in the corpus and
//! clears the frequency and length thresholds.

use std::collections::BTreeSet;
use std::sync::Arc;

use lessico_lexicon::{normalize, FrequencyIndex, MIN_FREQUENCY, MIN_LENGTH};
use lessico_llm::*;
use lessico_storage::DerivationStore;
use proptest::prelude::*;

const NOUNS: [&str; 3] = ["gatto", "casa", "mare"];

/// Corpus rows with padding, mixed case, short forms and low counts.
fn corpus_strategy() -> impl Strategy<Value = Vec<(String, u64)>> {
    prop::collection::vec(("[ ]{0,2}[a-zA-Z]{1,6}[ ]{0,2}", 0u64..12), 1..30)
}

/// A corpus plus model proposals, some drawn from the corpus (recased or
/// padded) and some made up.
fn scenario() -> impl Strategy<Value = (Vec<(String, u64)>, Vec<String>)> {
    corpus_strategy().prop_flat_map(|corpus| {
        let attested: Vec<String> = corpus.iter().map(|(form, _)| form.clone()).collect();
        let proposal = prop_oneof![
            prop::sample::select(attested.clone()),
            prop::sample::select(attested.clone()).prop_map(|f| f.to_uppercase()),
            prop::sample::select(attested).prop_map(|f| format!(" {} ", f.trim())),
            "[a-z]{1,7}",
        ];
        (Just(corpus), prop::collection::vec(proposal, 0..20))
    })
}

fn stored_forms(corpus: &[(String, u64)], proposals: Vec<String>) -> (FrequencyIndex, Vec<String>) {
    let index = FrequencyIndex::from_entries(corpus.iter().map(|(f, n)| (f.as_str(), *n)));
    let store = DerivationStore::in_memory();

    let answer = proposals.clone();
    let provider = Arc::new(FnProvider::new(move |prompt: &str| {
        let lemma = prompt.lines().last().unwrap_or("").trim().to_string();
        let mut verbs = answer.clone();
        verbs.reverse();
        let mut root = serde_json::Map::new();
        root.insert(
            lemma,
            serde_json::json!({ "morpho": { "a": answer, "r": "N/A", "v": verbs } }),
        );
        Ok(serde_json::Value::Object(root).to_string())
    }));
    let config = PipelineConfig {
        max_retries: 0,
        retry_backoff_ms: 1,
        ..PipelineConfig::default()
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let nouns: Vec<String> = NOUNS.iter().map(|s| s.to_string()).collect();
    let report = runtime.block_on(async {
        DerivationPipeline::new(&store, &index, provider, config)
            .run_generation(&nouns, &mut RunLedger::in_memory())
            .await
            .unwrap()
    });
    assert_eq!(report.processed, NOUNS.len());

    let forms = store.scan_pairs().into_iter().map(|p| p.form).collect();
    (index, forms)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn stored_forms_clear_corpus_thresholds((corpus, proposals) in scenario()) {
        let (index, forms) = stored_forms(&corpus, proposals.clone());

        for form in &forms {
            let frequency = index.frequency(form);
            prop_assert!(frequency.is_some(), "{form:?} is not in the corpus");
            prop_assert!(frequency.unwrap_or(0) >= MIN_FREQUENCY);
            prop_assert!(form.chars().count() >= MIN_LENGTH);
        }

        // Nothing attested is lost either.
        let expected: BTreeSet<String> = proposals
            .iter()
            .filter(|p| index.contains(p))
            .map(|p| normalize(p))
            .collect();
        let stored: BTreeSet<String> = forms.into_iter().collect();
        prop_assert_eq!(stored, expected);
    }
}
