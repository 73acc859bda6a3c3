//! Which nouns a generation run has already handled.
//!
//! Store operations are idempotent, so the ledger only saves model calls: a
//! lost ledger means redoing work, never corrupting data.

use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("cannot access ledger {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("ledger {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunLedger {
    #[serde(default)]
    processed: BTreeSet<String>,
    #[serde(default)]
    failed: BTreeMap<String, String>,
    #[serde(default)]
    rerequested: BTreeSet<String>,
    #[serde(skip)]
    path: Option<PathBuf>,
}

impl RunLedger {
    /// An unsaved ledger.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load from `path`, starting empty if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, LedgerError> {
        let mut ledger = if path.exists() {
            let text = std::fs::read_to_string(path).map_err(|source| LedgerError::Io {
                path: path.display().to_string(),
                source,
            })?;
            serde_json::from_str(&text).map_err(|source| LedgerError::Parse {
                path: path.display().to_string(),
                source,
            })?
        } else {
            Self::default()
        };
        ledger.path = Some(path.to_path_buf());
        Ok(ledger)
    }

    /// Write back to the file the ledger was loaded from (no-op in memory).
    pub fn save(&self) -> Result<(), LedgerError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        let io_err = |source| LedgerError::Io {
            path: path.display().to_string(),
            source,
        };
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        std::fs::create_dir_all(&dir).map_err(io_err)?;

        let text = serde_json::to_string_pretty(self).map_err(|source| LedgerError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(text.as_bytes()).map_err(io_err)?;
        tmp.as_file().sync_data().map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Nouns still to do, in input order: everything not yet processed, plus
    /// anything explicitly re-requested.
    pub fn pending(&self, nouns: &[String]) -> Vec<String> {
        let mut seen = BTreeSet::new();
        nouns
            .iter()
            .filter(|n| !self.processed.contains(*n) || self.rerequested.contains(*n))
            .filter(|n| seen.insert(n.as_str()))
            .cloned()
            .collect()
    }

    pub fn mark_processed(&mut self, lemma: &str) {
        self.failed.remove(lemma);
        self.rerequested.remove(lemma);
        self.processed.insert(lemma.to_string());
    }

    /// Record a failure. The lemma stays pending for the next run.
    pub fn mark_failed(&mut self, lemma: &str, reason: impl Into<String>) {
        self.failed.insert(lemma.to_string(), reason.into());
    }

    pub fn rerequest(&mut self, lemma: &str) {
        self.rerequested.insert(lemma.to_string());
    }

    pub fn is_processed(&self, lemma: &str) -> bool {
        self.processed.contains(lemma)
    }

    pub fn processed_count(&self) -> usize {
        self.processed.len()
    }

    pub fn failures(&self) -> &BTreeMap<String, String> {
        &self.failed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nouns(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_pending_skips_processed_and_keeps_failed() {
        let mut ledger = RunLedger::in_memory();
        ledger.mark_processed("gatto");
        ledger.mark_failed("casa", "timeout");

        let all = nouns(&["gatto", "casa", "mare", "casa"]);
        assert_eq!(ledger.pending(&all), nouns(&["casa", "mare"]));
        assert_eq!(ledger.failures().get("casa").map(String::as_str), Some("timeout"));

        ledger.rerequest("gatto");
        assert_eq!(ledger.pending(&all), nouns(&["gatto", "casa", "mare"]));

        ledger.mark_processed("gatto");
        ledger.mark_processed("casa");
        assert_eq!(ledger.pending(&all), nouns(&["mare"]));
        assert!(ledger.failures().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        let mut ledger = RunLedger::load(&path).unwrap();
        assert_eq!(ledger.processed_count(), 0);
        ledger.mark_processed("gatto");
        ledger.mark_failed("casa", "rate limited");
        ledger.save().unwrap();

        let reloaded = RunLedger::load(&path).unwrap();
        assert!(reloaded.is_processed("gatto"));
        assert!(!reloaded.is_processed("casa"));

        let raw: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(raw["processed"][0], "gatto");
        assert_eq!(raw["failed"]["casa"], "rate limited");
    }

    #[test]
    fn test_corrupt_ledger_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(RunLedger::load(&path), Err(LedgerError::Parse { .. })));
    }
}
