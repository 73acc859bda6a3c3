//! Lessico Derivation Store
//!
//! The store owns the two tables of the derivation database:
//!
//! ```text
//! words(id, lemma UNIQUE, pos)
//! derived_forms(id, lemma_id REFERENCES words(id), form, pos, relation_type)
//!                UNIQUE (lemma_id, form, pos)
//! ```
//!
//! ## Guarantees
//!
//! - **Idempotent inserts**: `add_word` and `add_derived_form` return the
//!   existing row when the key is already present.
//! - **Uniqueness in the store**: the lemma and triple indexes live next to
//!   the tables and are updated under the same lock, so no caller can create a
//!   duplicate row.
//! - **Single writer**: every mutation goes through one `parking_lot::Mutex`.
//! - **Durable**: with a directory attached, each mutation hits the WAL before
//!   it is applied; `checkpoint` folds the WAL into `snapshot.json`.
//! - **Human-gated removal**: derived forms are only removed one id at a time
//!   or through an explicit deletion script.

pub mod deletion;
pub mod persistence;

#[cfg(test)]
mod tests;

pub use deletion::{
    ApplyReport, DeletionScript, DeletionScriptEmitter, DeletionStatement, ScriptParseError,
};

use lessico_lexicon::{is_valid_lemma, normalize, PartOfSpeech, RelationType};
use parking_lot::Mutex;
use persistence::{SnapshotV1, WalEntry, WriteAheadLog, SNAPSHOT_FILE, SNAPSHOT_VERSION_V1, WAL_FILE};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

// ============================================================================
// Core Types
// ============================================================================

pub type WordId = u64;
pub type DerivedFormId = u64;

/// A noun lemma.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Word {
    pub id: WordId,
    pub lemma: String,
    pub pos: PartOfSpeech,
}

/// A form derived from a noun, accepted by the corpus filter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedForm {
    pub id: DerivedFormId,
    pub lemma_id: WordId,
    pub form: String,
    pub pos: PartOfSpeech,
    pub relation_type: RelationType,
}

/// Read-only view of one stored relation, as handed to the scanner.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScanPair {
    pub derived_form_id: DerivedFormId,
    pub noun: String,
    pub form: String,
    pub pos: PartOfSpeech,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub words: usize,
    pub derived_forms: usize,
    pub by_pos: BTreeMap<PartOfSpeech, usize>,
    pub nouns_without_derivations: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("snapshot error: {0}")]
    Snapshot(#[from] serde_json::Error),
    #[error("WAL encoding error: {0}")]
    Encode(String),
    #[error("store is corrupt: {0}")]
    Corrupt(String),
    #[error("invalid lemma {0:?}: expected a non-empty alphabetic word")]
    InvalidLemma(String),
    #[error("invalid derived form {0:?}")]
    InvalidForm(String),
    #[error("part of speech {0} cannot be a derived form")]
    InvalidPos(PartOfSpeech),
    /// A derived form referenced a word that does not exist. This means the
    /// caller skipped `add_word`; it is a pipeline defect, not bad data.
    #[error("no word with id {0}")]
    UnknownWord(WordId),
}

pub type Result<T> = std::result::Result<T, StoreError>;

// ============================================================================
// Tables
// ============================================================================

type TripleKey = (WordId, String, PartOfSpeech);

#[derive(Debug, Default)]
struct Tables {
    words: BTreeMap<WordId, Word>,
    derived_forms: BTreeMap<DerivedFormId, DerivedForm>,
    lemma_index: HashMap<String, WordId>,
    triple_index: HashMap<TripleKey, DerivedFormId>,
    next_word_id: u64,
    next_derived_form_id: u64,
}

impl Tables {
    fn new() -> Self {
        Self {
            next_word_id: 1,
            next_derived_form_id: 1,
            ..Default::default()
        }
    }

    fn from_snapshot(snapshot: SnapshotV1) -> Result<Self> {
        let mut tables = Self::new();
        for word in snapshot.words {
            tables.insert_word(word)?;
        }
        for df in snapshot.derived_forms {
            tables.insert_derived_form(df)?;
        }
        tables.next_word_id = tables.next_word_id.max(snapshot.next_word_id);
        tables.next_derived_form_id = tables
            .next_derived_form_id
            .max(snapshot.next_derived_form_id);
        Ok(tables)
    }

    fn to_snapshot(&self) -> SnapshotV1 {
        SnapshotV1 {
            version: SNAPSHOT_VERSION_V1.to_string(),
            written_at: chrono::Utc::now(),
            next_word_id: self.next_word_id,
            next_derived_form_id: self.next_derived_form_id,
            words: self.words.values().cloned().collect(),
            derived_forms: self.derived_forms.values().cloned().collect(),
        }
    }

    fn insert_word(&mut self, word: Word) -> Result<()> {
        if self.lemma_index.contains_key(&word.lemma) || self.words.contains_key(&word.id) {
            return Err(StoreError::Corrupt(format!(
                "duplicate word {} ({})",
                word.id, word.lemma
            )));
        }
        self.next_word_id = self.next_word_id.max(word.id + 1);
        self.lemma_index.insert(word.lemma.clone(), word.id);
        self.words.insert(word.id, word);
        Ok(())
    }

    fn insert_derived_form(&mut self, df: DerivedForm) -> Result<()> {
        if !self.words.contains_key(&df.lemma_id) {
            return Err(StoreError::UnknownWord(df.lemma_id));
        }
        let key = (df.lemma_id, df.form.clone(), df.pos);
        if self.triple_index.contains_key(&key) || self.derived_forms.contains_key(&df.id) {
            return Err(StoreError::Corrupt(format!(
                "duplicate derived form {} ({})",
                df.id, df.form
            )));
        }
        self.next_derived_form_id = self.next_derived_form_id.max(df.id + 1);
        self.triple_index.insert(key, df.id);
        self.derived_forms.insert(df.id, df);
        Ok(())
    }

    fn remove_derived_form(&mut self, id: DerivedFormId) -> Option<DerivedForm> {
        let df = self.derived_forms.remove(&id)?;
        self.triple_index.remove(&(df.lemma_id, df.form.clone(), df.pos));
        Some(df)
    }

    /// Re-apply a logged mutation. Replays are idempotent so a record that is
    /// also covered by the snapshot is harmless.
    fn replay(&mut self, entry: WalEntry) -> Result<()> {
        match entry {
            WalEntry::AddWord { id, lemma } => {
                if !self.lemma_index.contains_key(&lemma) {
                    self.insert_word(Word {
                        id,
                        lemma,
                        pos: PartOfSpeech::Noun,
                    })?;
                }
            }
            WalEntry::AddDerivedForm {
                id,
                lemma_id,
                form,
                pos,
            } => {
                if !self
                    .triple_index
                    .contains_key(&(lemma_id, form.clone(), pos))
                {
                    self.insert_derived_form(DerivedForm {
                        id,
                        lemma_id,
                        form,
                        pos,
                        relation_type: RelationType::Morphological,
                    })?;
                }
            }
            WalEntry::RemoveDerivedForm { id } => {
                self.remove_derived_form(id);
            }
        }
        Ok(())
    }
}

// ============================================================================
// Derivation Store
// ============================================================================

pub struct DerivationStore {
    tables: Mutex<Tables>,
    wal: Option<WriteAheadLog>,
    dir: Option<PathBuf>,
}

impl DerivationStore {
    /// A store with no backing files.
    pub fn in_memory() -> Self {
        Self {
            tables: Mutex::new(Tables::new()),
            wal: None,
            dir: None,
        }
    }

    /// Open (or create) a store directory: load the snapshot, then replay the
    /// write-ahead log on top of it.
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;

        let mut tables = match SnapshotV1::load(&dir.join(SNAPSHOT_FILE))? {
            Some(snapshot) => Tables::from_snapshot(snapshot)?,
            None => Tables::new(),
        };

        let wal = WriteAheadLog::open(&dir.join(WAL_FILE))?;
        let entries = wal.replay()?;
        let replayed = entries.len();
        for entry in entries {
            tables.replay(entry)?;
        }

        tracing::debug!(
            dir = %dir.display(),
            words = tables.words.len(),
            derived_forms = tables.derived_forms.len(),
            replayed,
            "derivation store opened"
        );

        Ok(Self {
            tables: Mutex::new(tables),
            wal: Some(wal),
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    fn log(&self, entry: &WalEntry) -> Result<()> {
        match &self.wal {
            Some(wal) => wal.append(entry),
            None => Ok(()),
        }
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// Insert a noun, or return the existing row for the same lemma.
    pub fn add_word(&self, lemma: &str) -> Result<Word> {
        let lemma = normalize(lemma);
        if !is_valid_lemma(&lemma) {
            return Err(StoreError::InvalidLemma(lemma));
        }

        let mut tables = self.tables.lock();
        if let Some(id) = tables.lemma_index.get(&lemma) {
            if let Some(word) = tables.words.get(id) {
                return Ok(word.clone());
            }
        }

        let word = Word {
            id: tables.next_word_id,
            lemma,
            pos: PartOfSpeech::Noun,
        };
        self.log(&WalEntry::AddWord {
            id: word.id,
            lemma: word.lemma.clone(),
        })?;
        tables.insert_word(word.clone())?;
        Ok(word)
    }

    /// Insert a derived form, or return the existing row for the same
    /// `(lemma_id, form, pos)`.
    pub fn add_derived_form(
        &self,
        lemma_id: WordId,
        form: &str,
        pos: PartOfSpeech,
    ) -> Result<DerivedForm> {
        let form = normalize(form);
        if form.is_empty() {
            return Err(StoreError::InvalidForm(form));
        }
        if !pos.is_derivable() {
            return Err(StoreError::InvalidPos(pos));
        }

        let mut tables = self.tables.lock();
        if !tables.words.contains_key(&lemma_id) {
            return Err(StoreError::UnknownWord(lemma_id));
        }
        let key = (lemma_id, form.clone(), pos);
        if let Some(id) = tables.triple_index.get(&key) {
            if let Some(df) = tables.derived_forms.get(id) {
                return Ok(df.clone());
            }
        }

        let df = DerivedForm {
            id: tables.next_derived_form_id,
            lemma_id,
            form,
            pos,
            relation_type: RelationType::Morphological,
        };
        self.log(&WalEntry::AddDerivedForm {
            id: df.id,
            lemma_id,
            form: df.form.clone(),
            pos,
        })?;
        tables.insert_derived_form(df.clone())?;
        Ok(df)
    }

    /// Remove a derived form. Returns `false` when the id was already absent.
    pub fn remove_derived_form(&self, id: DerivedFormId) -> Result<bool> {
        let mut tables = self.tables.lock();
        if !tables.derived_forms.contains_key(&id) {
            return Ok(false);
        }
        self.log(&WalEntry::RemoveDerivedForm { id })?;
        Ok(tables.remove_derived_form(id).is_some())
    }

    /// Execute a deletion script. This is the manual path: nothing in the
    /// pipeline calls it on its own.
    pub fn apply_deletion_script(&self, script: &DeletionScript) -> Result<ApplyReport> {
        let mut report = ApplyReport::default();
        for id in script.ids() {
            if self.remove_derived_form(id)? {
                report.removed.push(id);
            } else {
                report.already_absent.push(id);
            }
        }
        tracing::info!(
            removed = report.removed.len(),
            already_absent = report.already_absent.len(),
            "deletion script applied"
        );
        Ok(report)
    }

    /// Fold the WAL into a fresh snapshot and truncate it.
    pub fn checkpoint(&self) -> Result<()> {
        let (Some(dir), Some(wal)) = (&self.dir, &self.wal) else {
            return Ok(());
        };
        let tables = self.tables.lock();
        tables.to_snapshot().write_atomic(&dir.join(SNAPSHOT_FILE))?;
        wal.truncate()?;
        tracing::info!(
            dir = %dir.display(),
            words = tables.words.len(),
            derived_forms = tables.derived_forms.len(),
            "store checkpointed"
        );
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    pub fn word(&self, id: WordId) -> Option<Word> {
        self.tables.lock().words.get(&id).cloned()
    }

    pub fn word_by_lemma(&self, lemma: &str) -> Option<Word> {
        let tables = self.tables.lock();
        let id = tables.lemma_index.get(&normalize(lemma))?;
        tables.words.get(id).cloned()
    }

    pub fn derived_form(&self, id: DerivedFormId) -> Option<DerivedForm> {
        self.tables.lock().derived_forms.get(&id).cloned()
    }

    pub fn derived_forms_of(&self, lemma_id: WordId) -> Vec<DerivedForm> {
        self.tables
            .lock()
            .derived_forms
            .values()
            .filter(|df| df.lemma_id == lemma_id)
            .cloned()
            .collect()
    }

    /// Every stored relation, in derived-form id order.
    pub fn scan_pairs(&self) -> Vec<ScanPair> {
        let tables = self.tables.lock();
        tables
            .derived_forms
            .values()
            .filter_map(|df| {
                let word = tables.words.get(&df.lemma_id)?;
                Some(ScanPair {
                    derived_form_id: df.id,
                    noun: word.lemma.clone(),
                    form: df.form.clone(),
                    pos: df.pos,
                })
            })
            .collect()
    }

    /// Look up the relation behind a derived-form id.
    pub fn scan_pair(&self, id: DerivedFormId) -> Option<ScanPair> {
        let tables = self.tables.lock();
        let df = tables.derived_forms.get(&id)?;
        let word = tables.words.get(&df.lemma_id)?;
        Some(ScanPair {
            derived_form_id: df.id,
            noun: word.lemma.clone(),
            form: df.form.clone(),
            pos: df.pos,
        })
    }

    pub fn words(&self) -> Vec<Word> {
        self.tables.lock().words.values().cloned().collect()
    }

    pub fn word_count(&self) -> usize {
        self.tables.lock().words.len()
    }

    pub fn derived_form_count(&self) -> usize {
        self.tables.lock().derived_forms.len()
    }

    pub fn stats(&self) -> StoreStats {
        let tables = self.tables.lock();
        let mut by_pos: BTreeMap<PartOfSpeech, usize> = BTreeMap::new();
        let mut with_derivations = std::collections::HashSet::new();
        for df in tables.derived_forms.values() {
            *by_pos.entry(df.pos).or_default() += 1;
            with_derivations.insert(df.lemma_id);
        }
        StoreStats {
            words: tables.words.len(),
            derived_forms: tables.derived_forms.len(),
            by_pos,
            nouns_without_derivations: tables.words.len() - with_derivations.len(),
        }
    }
}

impl std::fmt::Debug for DerivationStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DerivationStore")
            .field("dir", &self.dir)
            .field("words", &self.word_count())
            .field("derived_forms", &self.derived_form_count())
            .finish()
    }
}
