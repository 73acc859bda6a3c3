//! Lessico lexical core
//!
//! Shared vocabulary for the derivation pipeline:
//!
//! - [`PartOfSpeech`] and [`RelationType`] tags as they appear in the store,
//! - [`normalize`] / [`is_valid_lemma`], the single definition of what a
//!   stored lemma or form looks like,
//! - [`CandidateProposal`], the transient output of candidate generation,
//! - [`frequency::FrequencyIndex`], the read-only corpus lookup,
//! - [`extract::LemmaExtractor`], noun extraction from a raw lexicon.

pub mod extract;
pub mod frequency;

pub use extract::{
    read_noun_list, write_noun_list, ExtractionReport, LemmaExtractor, LexiconEntry, LexiconError,
    Rejection,
};
pub use frequency::{FrequencyIndex, IndexError, IndexStats, MIN_FREQUENCY, MIN_LENGTH};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ============================================================================
// Tags
// ============================================================================

/// Part-of-speech tag, serialized with the single-letter codes used in the
/// `pos` columns (`n`, `a`, `v`, `r`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartOfSpeech {
    #[serde(rename = "n")]
    Noun,
    #[serde(rename = "a")]
    Adjective,
    #[serde(rename = "v")]
    Verb,
    #[serde(rename = "r")]
    Adverb,
}

impl PartOfSpeech {
    /// Tags a derived form may carry.
    pub const DERIVED: [PartOfSpeech; 3] = [
        PartOfSpeech::Adjective,
        PartOfSpeech::Verb,
        PartOfSpeech::Adverb,
    ];

    pub fn code(&self) -> &'static str {
        match self {
            PartOfSpeech::Noun => "n",
            PartOfSpeech::Adjective => "a",
            PartOfSpeech::Verb => "v",
            PartOfSpeech::Adverb => "r",
        }
    }

    /// True for the categories a derived form can have (`a`, `v`, `r`).
    pub fn is_derivable(&self) -> bool {
        !matches!(self, PartOfSpeech::Noun)
    }

    /// Italian label used in prompts.
    pub fn label_it(&self) -> &'static str {
        match self {
            PartOfSpeech::Noun => "sostantivo",
            PartOfSpeech::Adjective => "aggettivo",
            PartOfSpeech::Verb => "verbo",
            PartOfSpeech::Adverb => "avverbio",
        }
    }
}

impl fmt::Display for PartOfSpeech {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown part of speech: {0:?}")]
pub struct UnknownPos(pub String);

impl FromStr for PartOfSpeech {
    type Err = UnknownPos;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "n" | "noun" => Ok(PartOfSpeech::Noun),
            "a" | "adj" | "adjective" => Ok(PartOfSpeech::Adjective),
            "v" | "verb" => Ok(PartOfSpeech::Verb),
            "r" | "adv" | "adverb" => Ok(PartOfSpeech::Adverb),
            _ => Err(UnknownPos(s.to_string())),
        }
    }
}

/// Kind of relation between a noun and a derived form.
///
/// Only morphological relations exist today; the tag is stored so that other
/// relation kinds can be added without a schema change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationType {
    #[default]
    Morphological,
}

impl RelationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::Morphological => "morphological",
        }
    }
}

impl fmt::Display for RelationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Normalization
// ============================================================================

/// Canonical lookup key: surrounding whitespace stripped, lowercased.
pub fn normalize(term: &str) -> String {
    term.trim().to_lowercase()
}

/// A stored lemma is non-empty, lowercase and alphabetic-only.
///
/// "Alphabetic" is Unicode-aware so accented letters (`bontà`, `perché`)
/// are accepted.
pub fn is_valid_lemma(lemma: &str) -> bool {
    !lemma.is_empty()
        && lemma.chars().all(|c| c.is_alphabetic())
        && lemma.chars().all(|c| !c.is_uppercase())
}

/// Character count, which is what the length thresholds are measured in.
pub fn char_len(term: &str) -> usize {
    term.chars().count()
}

// ============================================================================
// Candidate proposals
// ============================================================================

/// A derived form proposed by the model for a noun.
///
/// Proposals are never persisted as-is; only those that survive the corpus
/// filter become stored derived forms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CandidateProposal {
    pub source_lemma: String,
    pub proposed_form: String,
    pub pos: PartOfSpeech,
}

impl CandidateProposal {
    pub fn new(source_lemma: &str, proposed_form: &str, pos: PartOfSpeech) -> Self {
        Self {
            source_lemma: source_lemma.to_string(),
            proposed_form: proposed_form.to_string(),
            pos,
        }
    }
}
