//! Store behaviour tests (in-memory and on-disk).

use super::*;
use tempfile::tempdir;

#[test]
fn test_add_word_is_idempotent() {
    let store = DerivationStore::in_memory();
    let first = store.add_word("gatto").unwrap();
    let second = store.add_word("gatto").unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(store.word_count(), 1);
    assert_eq!(first.pos, PartOfSpeech::Noun);
}

#[test]
fn test_add_word_normalizes_case_and_whitespace() {
    let store = DerivationStore::in_memory();
    let a = store.add_word(" Gatto ").unwrap();
    let b = store.add_word("gatto").unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(a.lemma, "gatto");
}

#[test]
fn test_add_word_rejects_invalid_lemmas() {
    let store = DerivationStore::in_memory();
    for bad in ["", "casa123", "porta finestra", "capo-stazione"] {
        assert!(
            matches!(store.add_word(bad), Err(StoreError::InvalidLemma(_))),
            "{bad:?} should be rejected"
        );
    }
    assert_eq!(store.word_count(), 0);
}

#[test]
fn test_add_derived_form_is_idempotent_on_triple() {
    let store = DerivationStore::in_memory();
    let word = store.add_word("gatto").unwrap();
    let a = store
        .add_derived_form(word.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    let b = store
        .add_derived_form(word.id, "Gattino ", PartOfSpeech::Adjective)
        .unwrap();
    assert_eq!(a.id, b.id);
    assert_eq!(store.derived_form_count(), 1);

    // Same form, different category is a different relation.
    let c = store
        .add_derived_form(word.id, "gattino", PartOfSpeech::Verb)
        .unwrap();
    assert_ne!(a.id, c.id);
    assert_eq!(store.derived_form_count(), 2);
    assert_eq!(c.relation_type, RelationType::Morphological);
}

#[test]
fn test_derived_form_requires_existing_word() {
    let store = DerivationStore::in_memory();
    let err = store
        .add_derived_form(99, "gattino", PartOfSpeech::Adjective)
        .unwrap_err();
    assert!(matches!(err, StoreError::UnknownWord(99)));
}

#[test]
fn test_derived_form_rejects_noun_pos_and_empty_form() {
    let store = DerivationStore::in_memory();
    let word = store.add_word("gatto").unwrap();
    assert!(matches!(
        store.add_derived_form(word.id, "gatta", PartOfSpeech::Noun),
        Err(StoreError::InvalidPos(PartOfSpeech::Noun))
    ));
    assert!(matches!(
        store.add_derived_form(word.id, "   ", PartOfSpeech::Verb),
        Err(StoreError::InvalidForm(_))
    ));
}

#[test]
fn test_remove_absent_is_noop() {
    let store = DerivationStore::in_memory();
    let word = store.add_word("gatto").unwrap();
    let df = store
        .add_derived_form(word.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    assert!(store.remove_derived_form(df.id).unwrap());
    assert!(!store.remove_derived_form(df.id).unwrap());
    assert!(!store.remove_derived_form(12345).unwrap());
    assert_eq!(store.derived_form_count(), 0);
    // Words are never removed with their derivations.
    assert_eq!(store.word_count(), 1);
}

#[test]
fn test_ids_are_not_reused_after_removal() {
    let store = DerivationStore::in_memory();
    let word = store.add_word("gatto").unwrap();
    let a = store
        .add_derived_form(word.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    store.remove_derived_form(a.id).unwrap();
    let b = store
        .add_derived_form(word.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    assert!(b.id > a.id);
}

#[test]
fn test_scan_pairs_join_noun_and_form() {
    let store = DerivationStore::in_memory();
    let gatto = store.add_word("gatto").unwrap();
    let casa = store.add_word("casa").unwrap();
    store
        .add_derived_form(gatto.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();
    store
        .add_derived_form(casa.id, "casalingo", PartOfSpeech::Adjective)
        .unwrap();

    let pairs = store.scan_pairs();
    assert_eq!(pairs.len(), 2);
    assert_eq!(pairs[0].noun, "gatto");
    assert_eq!(pairs[0].form, "gattino");
    assert_eq!(pairs[1].noun, "casa");

    let stats = store.stats();
    assert_eq!(stats.words, 2);
    assert_eq!(stats.by_pos.get(&PartOfSpeech::Adjective), Some(&2));
    assert_eq!(stats.nouns_without_derivations, 0);
}

#[test]
fn test_reopen_replays_wal() {
    let dir = tempdir().unwrap();
    let (gatto_id, removed_id) = {
        let store = DerivationStore::open(dir.path()).unwrap();
        let gatto = store.add_word("gatto").unwrap();
        store
            .add_derived_form(gatto.id, "gattino", PartOfSpeech::Adjective)
            .unwrap();
        let gone = store
            .add_derived_form(gatto.id, "gattare", PartOfSpeech::Verb)
            .unwrap();
        store.remove_derived_form(gone.id).unwrap();
        (gatto.id, gone.id)
    };

    let store = DerivationStore::open(dir.path()).unwrap();
    assert_eq!(store.word_by_lemma("gatto").unwrap().id, gatto_id);
    assert_eq!(store.derived_form_count(), 1);
    assert!(store.derived_form(removed_id).is_none());

    // Counters survive too: a new form gets a fresh id.
    let next = store
        .add_derived_form(gatto_id, "gattesco", PartOfSpeech::Adjective)
        .unwrap();
    assert!(next.id > removed_id);
}

#[test]
fn test_checkpoint_then_reopen() {
    let dir = tempdir().unwrap();
    {
        let store = DerivationStore::open(dir.path()).unwrap();
        let w = store.add_word("casa").unwrap();
        store
            .add_derived_form(w.id, "casalingo", PartOfSpeech::Adjective)
            .unwrap();
        store.checkpoint().unwrap();
        // Written after the checkpoint, only in the WAL.
        store
            .add_derived_form(w.id, "casualmente", PartOfSpeech::Adverb)
            .unwrap();
    }
    let wal_len = std::fs::metadata(dir.path().join(persistence::WAL_FILE))
        .unwrap()
        .len();
    assert!(wal_len > 0);

    let store = DerivationStore::open(dir.path()).unwrap();
    assert_eq!(store.word_count(), 1);
    assert_eq!(store.derived_form_count(), 2);
    assert!(dir.path().join(persistence::SNAPSHOT_FILE).exists());
}

#[test]
fn test_deletion_script_applied_twice() {
    let store = DerivationStore::in_memory();
    let gatto = store.add_word("gatto").unwrap();
    let df = store
        .add_derived_form(gatto.id, "gattino", PartOfSpeech::Adjective)
        .unwrap();

    let script = DeletionScriptEmitter::new().emit(&[df.id], &store);
    assert_eq!(script.len(), 1);
    assert!(script.render().contains("form='gattino'"));

    let first = store.apply_deletion_script(&script).unwrap();
    assert_eq!(first.removed, vec![df.id]);
    let second = store.apply_deletion_script(&script).unwrap();
    assert!(second.removed.is_empty());
    assert_eq!(second.already_absent, vec![df.id]);
    assert_eq!(store.derived_form_count(), 0);
}
