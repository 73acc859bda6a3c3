//! Corpus plausibility filter.
//!
//! A proposal survives iff its normalized form is in the frequency index.
//! This is deliberately permissive: a form that is attested in the corpus but
//! unrelated to the noun passes, and is left to the suspicion scan.

use lessico_lexicon::{normalize, CandidateProposal, FrequencyIndex};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FilterStats {
    pub accepted: usize,
    pub rejected: usize,
}

impl std::ops::AddAssign for FilterStats {
    fn add_assign(&mut self, other: Self) {
        self.accepted += other.accepted;
        self.rejected += other.rejected;
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CandidateFilter<'a> {
    index: &'a FrequencyIndex,
}

impl<'a> CandidateFilter<'a> {
    pub fn new(index: &'a FrequencyIndex) -> Self {
        Self { index }
    }

    pub fn accepts(&self, proposal: &CandidateProposal) -> bool {
        self.index.contains(&normalize(&proposal.proposed_form))
    }

    /// Keep attested proposals, with their form normalized.
    pub fn filter(&self, proposals: Vec<CandidateProposal>) -> (Vec<CandidateProposal>, FilterStats) {
        let mut stats = FilterStats::default();
        let mut accepted = Vec::with_capacity(proposals.len());
        for mut proposal in proposals {
            if self.accepts(&proposal) {
                proposal.proposed_form = normalize(&proposal.proposed_form);
                accepted.push(proposal);
                stats.accepted += 1;
            } else {
                tracing::trace!(form = %proposal.proposed_form, lemma = %proposal.source_lemma, "not in corpus");
                stats.rejected += 1;
            }
        }
        (accepted, stats)
    }
}
