//! Human confirmation of scanner flags.
//!
//! Nothing is deleted on the model's word alone: every flag goes through a
//! [`ReviewDecider`], and only rejections reach the deletion script.

use std::io::{BufRead, Write};

use lessico_storage::{DerivationStore, DerivedFormId};

use crate::scanner::FlaggedPair;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReviewOutcome {
    /// The relation is kept.
    Confirmed,
    /// The relation is wrong and should be deleted.
    Rejected,
}

pub trait ReviewDecider {
    fn decide(&mut self, flag: &FlaggedPair) -> ReviewOutcome;
}

/// Rejects every flag (non-interactive runs).
#[derive(Debug, Clone, Copy, Default)]
pub struct RejectAll;

impl ReviewDecider for RejectAll {
    fn decide(&mut self, _flag: &FlaggedPair) -> ReviewOutcome {
        ReviewOutcome::Rejected
    }
}

/// Asks on a terminal; `y` rejects the relation, anything else keeps it.
pub struct ConsoleReviewer<R, W> {
    input: R,
    output: W,
}

impl ConsoleReviewer<std::io::StdinLock<'static>, std::io::Stdout> {
    pub fn stdio() -> Self {
        Self::new(std::io::stdin().lock(), std::io::stdout())
    }
}

impl<R: BufRead, W: Write> ConsoleReviewer<R, W> {
    pub fn new(input: R, output: W) -> Self {
        Self { input, output }
    }

    fn ask(&mut self, flag: &FlaggedPair) -> std::io::Result<String> {
        write!(
            self.output,
            "Flagged: derived='{}' ({}) root='{}': {}\nDelete this relation? [y/N]: ",
            flag.pair.form, flag.pair.pos, flag.pair.noun, flag.reason
        )?;
        self.output.flush()?;
        let mut line = String::new();
        self.input.read_line(&mut line)?;
        Ok(line)
    }
}

impl<R: BufRead, W: Write> ReviewDecider for ConsoleReviewer<R, W> {
    fn decide(&mut self, flag: &FlaggedPair) -> ReviewOutcome {
        match self.ask(flag) {
            Ok(answer) if matches!(answer.trim().to_lowercase().as_str(), "y" | "yes" | "s" | "si" | "sì") => {
                ReviewOutcome::Rejected
            }
            Ok(_) => ReviewOutcome::Confirmed,
            Err(e) => {
                tracing::warn!(error = %e, "cannot read review answer, keeping relation");
                ReviewOutcome::Confirmed
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReviewSummary {
    pub rejected_ids: Vec<DerivedFormId>,
    pub confirmed: usize,
    /// Flags whose derived form is no longer in the store.
    pub skipped_missing: usize,
}

/// Put every still-present flag in front of the decider.
pub fn review(flags: &[FlaggedPair], store: &DerivationStore, decider: &mut dyn ReviewDecider) -> ReviewSummary {
    let mut summary = ReviewSummary::default();
    for flag in flags {
        if store.derived_form(flag.pair.derived_form_id).is_none() {
            summary.skipped_missing += 1;
            continue;
        }
        match decider.decide(flag) {
            ReviewOutcome::Rejected => summary.rejected_ids.push(flag.pair.derived_form_id),
            ReviewOutcome::Confirmed => summary.confirmed += 1,
        }
    }
    tracing::info!(
        rejected = summary.rejected_ids.len(),
        confirmed = summary.confirmed,
        skipped = summary.skipped_missing,
        "review finished"
    );
    summary
}
