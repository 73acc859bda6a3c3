//! Corpus frequency index.
//!
//! A read-only `lemma -> frequency` table built once from a lemma-frequency
//! listing (paisà style). Only entries that clear both thresholds are kept, so
//! every successful lookup is already plausibility-filtered:
//!
//! - frequency ≥ [`MIN_FREQUENCY`]
//! - length ≥ [`MIN_LENGTH`] characters
//!
//! Accepted line shapes (comments start with `#`):
//!
//! ```text
//! gattino,12
//! gattino	12
//! gattino   12   extra-columns-ignored
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::{char_len, normalize};

pub const MIN_FREQUENCY: u64 = 5;
pub const MIN_LENGTH: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("frequency index unavailable: cannot read {path}: {source}")]
    IndexUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Build counters, reported once after loading.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub kept: usize,
    pub below_threshold: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct FrequencyIndex {
    entries: HashMap<String, u64>,
    stats: IndexStats,
}

impl FrequencyIndex {
    /// Load the index from a frequency file.
    ///
    /// A missing or unreadable file is fatal; malformed lines are not.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let text = std::fs::read_to_string(path).map_err(|source| IndexError::IndexUnavailable {
            path: path.to_path_buf(),
            source,
        })?;
        let index = Self::parse(&text);
        tracing::info!(
            path = %path.display(),
            kept = index.stats.kept,
            below_threshold = index.stats.below_threshold,
            malformed = index.stats.malformed,
            "frequency index loaded"
        );
        Ok(index)
    }

    /// Parse the text of a frequency file.
    pub fn parse(text: &str) -> Self {
        let mut malformed = 0;
        let mut parsed = Vec::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            match parse_line(line) {
                Some(entry) => parsed.push(entry),
                None => malformed += 1,
            }
        }
        let mut index = Self::from_entries(parsed);
        index.stats.malformed = malformed;
        index
    }

    /// Build from in-memory `(lemma, frequency)` pairs, applying the same
    /// thresholds as the file loader.
    pub fn from_entries<I, S>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, u64)>,
        S: AsRef<str>,
    {
        let mut map: HashMap<String, u64> = HashMap::new();
        let mut below_threshold = 0;
        for (lemma, frequency) in entries {
            let key = normalize(lemma.as_ref());
            if frequency < MIN_FREQUENCY || char_len(&key) < MIN_LENGTH {
                below_threshold += 1;
                continue;
            }
            let slot = map.entry(key).or_insert(0);
            *slot = (*slot).max(frequency);
        }
        let stats = IndexStats {
            kept: map.len(),
            below_threshold,
            malformed: 0,
        };
        Self {
            entries: map,
            stats,
        }
    }

    pub fn contains(&self, term: &str) -> bool {
        self.entries.contains_key(&normalize(term))
    }

    pub fn frequency(&self, term: &str) -> Option<u64> {
        self.entries.get(&normalize(term)).copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn stats(&self) -> IndexStats {
        self.stats
    }
}

fn parse_line(line: &str) -> Option<(String, u64)> {
    let mut fields = if line.contains(',') {
        line.split(',').map(str::trim).collect::<Vec<_>>()
    } else if line.contains('\t') {
        line.split('\t').map(str::trim).collect::<Vec<_>>()
    } else {
        line.split_whitespace().collect::<Vec<_>>()
    };
    fields.retain(|f| !f.is_empty());
    if fields.len() < 2 {
        return None;
    }
    let frequency = fields[1].parse::<u64>().ok()?;
    Some((fields[0].to_string(), frequency))
}
