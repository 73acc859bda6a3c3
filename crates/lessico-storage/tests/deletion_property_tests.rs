//! Deletion scripts are idempotent and order-independent.

use lessico_lexicon::PartOfSpeech;
use lessico_storage::*;
use proptest::prelude::*;

/// Build a store with `n` nouns, each with one adjective, and return the
/// derived-form ids.
fn seeded_store(n: usize) -> (DerivationStore, Vec<DerivedFormId>) {
    let store = DerivationStore::in_memory();
    let mut ids = Vec::new();
    for i in 0..n {
        let lemma: String = std::iter::repeat('a').take(i + 2).collect();
        let word = store.add_word(&lemma).unwrap();
        let df = store
            .add_derived_form(word.id, &format!("{lemma}ino"), PartOfSpeech::Adjective)
            .unwrap();
        ids.push(df.id);
    }
    (store, ids)
}

fn surviving_ids(store: &DerivationStore) -> Vec<DerivedFormId> {
    store.scan_pairs().into_iter().map(|p| p.derived_form_id).collect()
}

fn run(store: &DerivationStore, ids: &[DerivedFormId]) {
    for &id in ids {
        let script = DeletionScript::from_statements([DeletionStatement { id, note: None }]);
        store.apply_deletion_script(&script).unwrap();
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn replaying_script_twice_equals_once(
        n in 1usize..12,
        picks in prop::collection::vec(0usize..16, 0..12),
    ) {
        let (once, ids) = seeded_store(n);
        let (twice, _) = seeded_store(n);
        // Ids outside the table exercise the absent-id path.
        let rejected: Vec<DerivedFormId> = picks.iter().map(|&p| ids.get(p).copied().unwrap_or(1000 + p as u64)).collect();

        let script = DeletionScriptEmitter::new().emit(&rejected, &once);
        once.apply_deletion_script(&script).unwrap();
        twice.apply_deletion_script(&script).unwrap();
        twice.apply_deletion_script(&script).unwrap();

        prop_assert_eq!(surviving_ids(&once), surviving_ids(&twice));
    }

    #[test]
    fn statement_order_does_not_matter(
        n in 1usize..12,
        picks in prop::collection::vec(0usize..12, 0..12),
        shuffled in prop::collection::vec(any::<prop::sample::Index>(), 0..24),
    ) {
        let (forward, ids) = seeded_store(n);
        let (permuted, _) = seeded_store(n);
        let rejected: Vec<DerivedFormId> = picks.iter().filter_map(|&p| ids.get(p).copied()).collect();

        run(&forward, &rejected);

        // Arbitrary order, with repetitions.
        let mut order = rejected.clone();
        order.reverse();
        for idx in &shuffled {
            if !rejected.is_empty() {
                order.push(rejected[idx.index(rejected.len())]);
            }
        }
        run(&permuted, &order);

        prop_assert_eq!(surviving_ids(&forward), surviving_ids(&permuted));
    }

    #[test]
    fn parsed_script_matches_emitted(
        n in 1usize..8,
        picks in prop::collection::vec(0usize..8, 0..8),
    ) {
        let (store, ids) = seeded_store(n);
        let rejected: Vec<DerivedFormId> = picks.iter().filter_map(|&p| ids.get(p).copied()).collect();
        let script = DeletionScriptEmitter::new().emit(&rejected, &store);
        let parsed = DeletionScript::parse(&script.render()).unwrap();
        prop_assert_eq!(parsed.ids(), script.ids());
    }
}

#[test]
fn scenario_reject_gattino_then_apply_twice() {
    let store = DerivationStore::in_memory();
    let gatto = store.add_word("gatto").unwrap();
    let gattino = store
        .add_derived_form(gatto.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();

    let script = DeletionScriptEmitter::new().emit(&[gattino.id], &store);
    assert_eq!(script.len(), 1);

    let text = script.render();
    let reread = DeletionScript::parse(&text).unwrap();
    store.apply_deletion_script(&reread).unwrap();
    store.apply_deletion_script(&reread).unwrap();

    assert!(store.derived_forms_of(gatto.id).is_empty());
    assert_eq!(store.word_count(), 1);
}
