//! Noun extraction from a raw lexicon.
//!
//! The extractor is a pure transform: lexicon lines in, an ordered,
//! deduplicated noun list out. Nothing here fails on bad data; malformed lines
//! are counted and skipped.

use std::collections::HashSet;
use std::path::Path;

use crate::{char_len, PartOfSpeech};

/// Minimum noun length, in characters.
pub const MIN_NOUN_LENGTH: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum LexiconError {
    #[error("cannot read lexicon {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// One `(lemma, part-of-speech)` pair of the source lexicon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LexiconEntry {
    pub lemma: String,
    pub pos: PartOfSpeech,
}

impl LexiconEntry {
    pub fn new(lemma: &str, pos: PartOfSpeech) -> Self {
        Self {
            lemma: lemma.to_string(),
            pos,
        }
    }

    /// Parse `lemma<TAB>pos`, falling back to whitespace when there is no tab.
    pub fn parse_line(line: &str) -> Option<Self> {
        let (lemma, pos) = match line.split_once('\t') {
            Some((lemma, pos)) => (lemma, pos),
            None => line.trim().rsplit_once(char::is_whitespace)?,
        };
        let lemma = lemma.trim();
        if lemma.is_empty() {
            return None;
        }
        let pos = pos.trim().parse::<PartOfSpeech>().ok()?;
        Some(Self::new(lemma, pos))
    }
}

/// Why a noun-tagged entry was left out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    HasDigit,
    HasWhitespace,
    HasSymbol,
    TooShort,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExtractionReport {
    pub nouns: Vec<String>,
    pub malformed_lines: usize,
    pub not_nouns: usize,
    pub rejected: usize,
    pub duplicates: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct LemmaExtractor;

impl LemmaExtractor {
    pub fn new() -> Self {
        Self
    }

    /// Check a single noun candidate.
    pub fn check(lemma: &str) -> Result<(), Rejection> {
        if lemma.chars().any(|c| c.is_numeric()) {
            return Err(Rejection::HasDigit);
        }
        if lemma.chars().any(char::is_whitespace) {
            return Err(Rejection::HasWhitespace);
        }
        if !lemma.chars().all(char::is_alphabetic) {
            return Err(Rejection::HasSymbol);
        }
        if char_len(lemma) < MIN_NOUN_LENGTH {
            return Err(Rejection::TooShort);
        }
        Ok(())
    }

    /// Extract nouns from already-parsed entries.
    pub fn extract<'a, I>(&self, entries: I) -> ExtractionReport
    where
        I: IntoIterator<Item = &'a LexiconEntry>,
    {
        let mut report = ExtractionReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        for entry in entries {
            self.accept(entry, &mut seen, &mut report);
        }
        report
    }

    /// Extract nouns from lexicon text, one entry per line.
    pub fn extract_text(&self, text: &str) -> ExtractionReport {
        let mut report = ExtractionReport::default();
        let mut seen: HashSet<String> = HashSet::new();
        for line in text.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            match LexiconEntry::parse_line(line) {
                Some(entry) => self.accept(&entry, &mut seen, &mut report),
                None => report.malformed_lines += 1,
            }
        }
        report
    }

    pub fn extract_file(&self, path: &Path) -> Result<ExtractionReport, LexiconError> {
        let text = std::fs::read_to_string(path).map_err(|source| LexiconError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let report = self.extract_text(&text);
        tracing::info!(
            nouns = report.nouns.len(),
            malformed = report.malformed_lines,
            rejected = report.rejected,
            duplicates = report.duplicates,
            "lexicon extracted"
        );
        Ok(report)
    }

    fn accept(
        &self,
        entry: &LexiconEntry,
        seen: &mut HashSet<String>,
        report: &mut ExtractionReport,
    ) {
        if entry.pos != PartOfSpeech::Noun {
            report.not_nouns += 1;
            return;
        }
        let lemma = entry.lemma.trim();
        if Self::check(lemma).is_err() {
            report.rejected += 1;
            return;
        }
        if !seen.insert(lemma.to_string()) {
            report.duplicates += 1;
            return;
        }
        report.nouns.push(lemma.to_string());
    }
}

/// Read a noun list written one lemma per line.
pub fn read_noun_list(path: &Path) -> Result<Vec<String>, LexiconError> {
    let text = std::fs::read_to_string(path).map_err(|source| LexiconError::Io {
        path: path.display().to_string(),
        source,
    })?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty() && !l.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Write a noun list one lemma per line.
pub fn write_noun_list(path: &Path, nouns: &[String]) -> Result<(), LexiconError> {
    let mut text = nouns.join("\n");
    text.push('\n');
    std::fs::write(path, text).map_err(|source| LexiconError::Io {
        path: path.display().to_string(),
        source,
    })
}
