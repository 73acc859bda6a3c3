//! Property tests for extraction and the frequency index.

use lessico_lexicon::*;
use proptest::prelude::*;
use std::collections::HashSet;

// ============================================================================
// Strategies
// ============================================================================

/// Lemma-ish strings: mostly letters, sometimes digits, symbols or spaces.
fn raw_lemma_strategy() -> impl Strategy<Value = String> {
    prop_oneof![
        "[a-zàèéìòù]{0,10}",
        "[a-z]{1,6}[0-9]{1,3}",
        "[a-z]{1,5}[ '\\-.][a-z]{1,5}",
        "[A-Z][a-z]{1,8}",
    ]
}

fn pos_strategy() -> impl Strategy<Value = PartOfSpeech> {
    prop_oneof![
        3 => Just(PartOfSpeech::Noun),
        1 => Just(PartOfSpeech::Adjective),
        1 => Just(PartOfSpeech::Verb),
        1 => Just(PartOfSpeech::Adverb),
    ]
}

fn lexicon_strategy() -> impl Strategy<Value = Vec<LexiconEntry>> {
    prop::collection::vec(
        (raw_lemma_strategy(), pos_strategy()).prop_map(|(l, p)| LexiconEntry::new(&l, p)),
        0..60,
    )
}

// ============================================================================
// Extraction invariants
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn extraction_has_no_duplicates_or_invalid_entries(lexicon in lexicon_strategy()) {
        let report = LemmaExtractor::new().extract(&lexicon);

        let unique: HashSet<&String> = report.nouns.iter().collect();
        prop_assert_eq!(unique.len(), report.nouns.len());

        for noun in &report.nouns {
            prop_assert!(!noun.chars().any(|c| c.is_numeric()), "digit in {}", noun);
            prop_assert!(!noun.chars().any(char::is_whitespace), "whitespace in {}", noun);
            prop_assert!(noun.chars().all(char::is_alphabetic), "symbol in {}", noun);
            prop_assert!(noun.chars().count() >= 2, "too short: {}", noun);
        }
    }

    #[test]
    fn extraction_preserves_first_occurrence_order(lexicon in lexicon_strategy()) {
        let report = LemmaExtractor::new().extract(&lexicon);
        let first_seen: Vec<String> = {
            let mut seen = HashSet::new();
            lexicon
                .iter()
                .filter(|e| e.pos == PartOfSpeech::Noun)
                .map(|e| e.lemma.trim().to_string())
                .filter(|l| LemmaExtractor::check(l).is_ok())
                .filter(|l| seen.insert(l.clone()))
                .collect()
        };
        prop_assert_eq!(report.nouns, first_seen);
    }

    #[test]
    fn extraction_is_deterministic(lexicon in lexicon_strategy()) {
        let a = LemmaExtractor::new().extract(&lexicon);
        let b = LemmaExtractor::new().extract(&lexicon);
        prop_assert_eq!(a, b);
    }
}

// ============================================================================
// Frequency index invariants
// ============================================================================

proptest! {
    #[test]
    fn index_only_holds_entries_above_thresholds(
        entries in prop::collection::vec(("[a-z]{1,8}", 0u64..20), 0..80)
    ) {
        let index = FrequencyIndex::from_entries(entries.iter().map(|(l, f)| (l.as_str(), *f)));
        for (lemma, _) in &entries {
            if let Some(freq) = index.frequency(lemma) {
                prop_assert!(freq >= MIN_FREQUENCY);
                prop_assert!(lemma.chars().count() >= MIN_LENGTH);
            }
        }
        for (lemma, freq) in &entries {
            if *freq >= MIN_FREQUENCY && lemma.chars().count() >= MIN_LENGTH {
                prop_assert!(index.contains(lemma));
            }
        }
    }
}
