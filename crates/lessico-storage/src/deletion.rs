//! Deletion scripts for human-rejected derivations.
//!
//! A script is plain text, one statement per derived form:
//!
//! ```text
//! -- lessico deletion script
//! DELETE FROM derived_forms WHERE id = 42;  -- form='gattino' lemma='gatto'
//! ```
//!
//! Statements only ever name a primary key, so each one is idempotent and
//! they commute: any replay order, any number of times, ends in the same
//! state. Scripts are written for an operator to run; the pipeline never
//! applies them itself.

use nom::{
    bytes::complete::{tag, tag_no_case},
    character::complete::{char as pchar, digit1, multispace0, multispace1, not_line_ending},
    combinator::{all_consuming, map_res, opt},
    sequence::preceded,
    IResult,
};
use std::collections::BTreeMap;
use std::path::Path;

use crate::{DerivationStore, DerivedFormId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeletionStatement {
    pub id: DerivedFormId,
    /// Human-readable context rendered as a trailing SQL comment.
    pub note: Option<String>,
}

impl DeletionStatement {
    pub fn render(&self) -> String {
        match &self.note {
            Some(note) => format!("DELETE FROM derived_forms WHERE id = {};  -- {}", self.id, note),
            None => format!("DELETE FROM derived_forms WHERE id = {};", self.id),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionScript {
    statements: Vec<DeletionStatement>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    pub removed: Vec<DerivedFormId>,
    pub already_absent: Vec<DerivedFormId>,
}

#[derive(Debug, thiserror::Error)]
pub enum ScriptParseError {
    #[error("line {line}: expected `DELETE FROM derived_forms WHERE id = <n>;`, found {text:?}")]
    Syntax { line: usize, text: String },
    #[error("cannot access deletion script: {0}")]
    Io(#[from] std::io::Error),
}

impl DeletionScript {
    /// Build a script from ids, deduplicated and ordered by id.
    pub fn from_statements(statements: impl IntoIterator<Item = DeletionStatement>) -> Self {
        let mut by_id: BTreeMap<DerivedFormId, DeletionStatement> = BTreeMap::new();
        for st in statements {
            by_id.entry(st.id).or_insert(st);
        }
        Self {
            statements: by_id.into_values().collect(),
        }
    }

    pub fn statements(&self) -> &[DeletionStatement] {
        &self.statements
    }

    pub fn ids(&self) -> Vec<DerivedFormId> {
        self.statements.iter().map(|s| s.id).collect()
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str("-- lessico deletion script\n");
        out.push_str(&format!(
            "-- generated {}; {} statement(s)\n",
            chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
            self.statements.len()
        ));
        out.push_str("-- review, back up the store, then run: lessico apply-deletions --script <this file>\n");
        for st in &self.statements {
            out.push_str(&st.render());
            out.push('\n');
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ScriptParseError> {
        std::fs::write(path, self.render())?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, ScriptParseError> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse a script. Blank lines and `--` comment lines are skipped.
    pub fn parse(text: &str) -> Result<Self, ScriptParseError> {
        let mut statements = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with("--") {
                continue;
            }
            let (_, st) = all_consuming(parse_statement)(trimmed).map_err(|_| {
                ScriptParseError::Syntax {
                    line: idx + 1,
                    text: trimmed.to_string(),
                }
            })?;
            statements.push(st);
        }
        Ok(Self::from_statements(statements))
    }
}

fn parse_id(input: &str) -> IResult<&str, u64> {
    map_res(digit1, str::parse::<u64>)(input)
}

fn parse_statement(input: &str) -> IResult<&str, DeletionStatement> {
    let (input, _) = tag_no_case("DELETE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("FROM")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag("derived_forms")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag_no_case("WHERE")(input)?;
    let (input, _) = multispace1(input)?;
    let (input, _) = tag("id")(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = pchar('=')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, id) = parse_id(input)?;
    let (input, _) = multispace0(input)?;
    let (input, _) = pchar(';')(input)?;
    let (input, _) = multispace0(input)?;
    let (input, note) = opt(preceded(tag("--"), not_line_ending))(input)?;
    let note = note
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string);
    Ok((input, DeletionStatement { id, note }))
}

// ============================================================================
// Emitter
// ============================================================================

/// Turns human-confirmed rejections into a deletion script.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeletionScriptEmitter;

impl DeletionScriptEmitter {
    pub fn new() -> Self {
        Self
    }

    /// One statement per rejected id. Rows still present in the store get a
    /// comment naming the form and its noun; ids already gone are emitted
    /// anyway, since deleting them is a no-op.
    pub fn emit(&self, rejected: &[DerivedFormId], store: &DerivationStore) -> DeletionScript {
        DeletionScript::from_statements(rejected.iter().map(|&id| DeletionStatement {
            id,
            note: store.scan_pair(id).map(|pair| {
                format!(
                    "form='{}' pos={} lemma='{}'",
                    sql_comment_safe(&pair.form),
                    pair.pos,
                    sql_comment_safe(&pair.noun)
                )
            }),
        }))
    }
}

fn sql_comment_safe(s: &str) -> String {
    s.replace(['\n', '\r'], " ").replace('\'', "''")
}
