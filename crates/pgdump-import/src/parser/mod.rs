//! Statement parser for plain-text pg_dump output.
//!
//! Parsing is deterministic and side-effect free: the same text always yields
//! the same [`ParsedSqlFile`]. Integrity heuristics run first over the raw
//! text and their findings are stored in the metadata, so a caller can decide
//! whether to repair before importing.

mod classify;
pub mod columns;
pub(crate) mod lexer;
mod rewrite;

use std::collections::{BTreeMap, BTreeSet};
use std::ops::Range;
use std::path::Path;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

pub use classify::StatementKind;
pub use columns::{implied_schema, ColumnDefinition, TableDefinition};
pub(crate) use classify::{is_ownership, skip_quoted};
pub use rewrite::rewrite_drop;

use crate::core::identifier::{split_qualified, TableRef};
use crate::error::Result;
use crate::integrity::{self, IntegrityIssue, IssueSeverity, RepairSuggestion};

static DUMPED_FROM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^--\s*Dumped from database version\s+(.+)$").unwrap());
static DUMPED_BY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^--\s*Dumped by pg_dump version\s+(.+)$").unwrap());
static STARTED_ON: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^--\s*Started on\s+(.+)$").unwrap());
static DUMP_COMPLETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^--\s*PostgreSQL database dump complete").unwrap());
static DATA_PREFIX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^(?:INSERT\s+INTO|COPY)\s+").unwrap());

/// One parsed statement. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Statement {
    /// Position in the dump, 0-based.
    pub index: usize,
    pub kind: StatementKind,
    pub text: String,
    /// Byte range in the source text.
    pub span: Range<usize>,
    /// 1-based line of the first byte.
    pub line: usize,
    /// Table the statement creates, fills or decorates.
    pub target: Option<TableRef>,
    /// Rows carried by INSERT/COPY statements.
    pub estimated_rows: u64,
}

impl Statement {
    /// Statement text shortened for logs and error records.
    pub fn preview(&self, max: usize) -> String {
        truncate_text(&self.text, max)
    }
}

/// The unterminated fragment at the end of a truncated dump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IncompleteStatement {
    pub text: String,
    /// Byte offset where the fragment begins.
    pub start: usize,
    pub line: usize,
    /// What was left open, e.g. "1 unclosed parenthesis".
    pub reason: String,
}

/// Facts derived from the whole dump.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DumpMetadata {
    pub total_statements: usize,
    /// Schema-qualified `schema.table` names.
    pub table_names: BTreeSet<String>,
    pub estimated_row_count: u64,
    pub row_counts_by_table: BTreeMap<String, u64>,
    pub pg_dump_version: Option<String>,
    pub source_version: Option<String>,
    pub export_date: Option<String>,
    pub is_complete: bool,
    pub has_proper_ending: bool,
    pub truncated_table_name: Option<String>,
    pub incomplete_statement: Option<IncompleteStatement>,
    pub integrity_issues: Vec<IntegrityIssue>,
    pub repair_suggestions: Vec<RepairSuggestion>,
    /// SHA-256 of the parsed text.
    pub content_sha256: String,
}

/// A dump split into typed statements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedSqlFile {
    pub statements: Vec<Statement>,
    pub metadata: DumpMetadata,
    /// Non-fatal observations.
    pub warnings: Vec<String>,
}

impl ParsedSqlFile {
    /// Parse dump text.
    pub fn parse(text: &str) -> Self {
        Self::parse_with_size(text, text.len() as u64)
    }

    /// Parse dump text read from a source of `byte_size` bytes.
    pub fn parse_with_size(text: &str, byte_size: u64) -> Self {
        let report = integrity::check_file_integrity(text, byte_size);
        let lex = lexer::split(text);
        let lines = LineIndex::new(text);

        let statements: Vec<Statement> = lex
            .statements
            .iter()
            .enumerate()
            .map(|(index, raw)| {
                let body = &text[raw.span.clone()];
                let copy_rows = raw
                    .copy_data
                    .as_ref()
                    .map(|data| text[data.clone()].lines().count() as u64);
                let classified = classify::classify(body, copy_rows);
                Statement {
                    index,
                    kind: classified.kind,
                    text: body.to_string(),
                    span: raw.span.clone(),
                    line: lines.line_of(raw.span.start),
                    target: classified.target,
                    estimated_rows: classified.rows,
                }
            })
            .collect();

        let mut metadata = DumpMetadata {
            total_statements: statements.len(),
            is_complete: lex.unterminated.is_none(),
            content_sha256: format!("{:x}", Sha256::digest(text.as_bytes())),
            ..DumpMetadata::default()
        };

        for stmt in &statements {
            if !matches!(stmt.kind, StatementKind::TableDdl | StatementKind::DataDml) {
                continue;
            }
            if let Some(target) = &stmt.target {
                metadata.table_names.insert(target.qualified());
                if stmt.kind == StatementKind::DataDml {
                    metadata.estimated_row_count += stmt.estimated_rows;
                    *metadata
                        .row_counts_by_table
                        .entry(target.qualified())
                        .or_default() += stmt.estimated_rows;
                }
            }
        }

        let last_end = statements.last().map(|s| s.span.end).unwrap_or(0);
        for comment in &lex.comments {
            if let Some(caps) = DUMPED_FROM.captures(&comment.text) {
                metadata.source_version = Some(caps[1].trim().to_string());
            } else if let Some(caps) = DUMPED_BY.captures(&comment.text) {
                metadata.pg_dump_version = Some(caps[1].trim().to_string());
            } else if let Some(caps) = STARTED_ON.captures(&comment.text) {
                metadata.export_date = Some(caps[1].trim().to_string());
            } else if DUMP_COMPLETE.is_match(&comment.text) && comment.offset >= last_end {
                metadata.has_proper_ending = lex.unterminated.is_none();
            }
        }

        if let Some(open) = &lex.unterminated {
            let fragment = &text[open.start..];
            metadata.truncated_table_name = truncated_table(fragment);
            metadata.incomplete_statement = Some(IncompleteStatement {
                text: fragment.to_string(),
                start: open.start,
                line: lines.line_of(open.start),
                reason: open.open.describe(),
            });
        }

        metadata.integrity_issues = report.issues;
        metadata.repair_suggestions = report.suggestions;

        let warnings = collect_warnings(&statements);

        debug!(
            "Parsed {} statements ({} tables, ~{} rows, complete: {})",
            metadata.total_statements,
            metadata.table_names.len(),
            metadata.estimated_row_count,
            metadata.is_complete
        );

        Self {
            statements,
            metadata,
            warnings,
        }
    }

    /// Statements of one kind, in file order.
    pub fn statements_of(&self, kind: StatementKind) -> impl Iterator<Item = &Statement> {
        self.statements.iter().filter(move |s| s.kind == kind)
    }

    /// Statements grouped by kind, each group in file order.
    pub fn partition(&self) -> BTreeMap<StatementKind, Vec<&Statement>> {
        let mut groups: BTreeMap<StatementKind, Vec<&Statement>> = BTreeMap::new();
        for stmt in &self.statements {
            groups.entry(stmt.kind).or_default().push(stmt);
        }
        groups
    }

    /// Integrity issues that block an import until repaired or overridden.
    pub fn blocking_issues(&self) -> Vec<&IntegrityIssue> {
        self.metadata
            .integrity_issues
            .iter()
            .filter(|i| i.severity == IssueSeverity::Error)
            .collect()
    }

    pub fn has_blocking_issues(&self) -> bool {
        !self.blocking_issues().is_empty()
    }
}

/// Decode raw bytes (lossily) and parse them.
pub fn parse_dump(bytes: &[u8]) -> ParsedSqlFile {
    let text = String::from_utf8_lossy(bytes);
    ParsedSqlFile::parse_with_size(&text, bytes.len() as u64)
}

/// Read and parse a dump file.
pub fn load_dump<P: AsRef<Path>>(path: P) -> Result<ParsedSqlFile> {
    let bytes = std::fs::read(path)?;
    Ok(parse_dump(&bytes))
}

/// The table an unterminated INSERT/COPY was writing to, as written.
fn truncated_table(fragment: &str) -> Option<String> {
    let m = DATA_PREFIX.find(fragment.trim_start())?;
    let rest = &fragment.trim_start()[m.end()..];
    let parts = split_qualified(rest)?;
    match parts.as_slice() {
        [name] => Some(name.clone()),
        [.., schema, name] => Some(format!("{}.{}", schema, name)),
        [] => None,
    }
}

fn collect_warnings(statements: &[Statement]) -> Vec<String> {
    let mut warnings = Vec::new();
    if statements.iter().any(|s| classify::is_drop(&s.text)) {
        warnings.push("File contains DROP statements that will delete existing data".to_string());
    }
    if statements.iter().any(|s| classify::is_truncate(&s.text)) {
        warnings.push("File contains TRUNCATE statements".to_string());
    }
    if statements
        .iter()
        .any(|s| classify::is_transaction_control(&s.text))
    {
        warnings.push(
            "File contains its own BEGIN/COMMIT; batches are already wrapped in transactions"
                .to_string(),
        );
    }
    warnings
}

pub(crate) fn truncate_text(text: &str, max: usize) -> String {
    if text.chars().count() <= max {
        return text.to_string();
    }
    let cut: String = text.chars().take(max).collect();
    format!("{}...", cut)
}

/// Byte offset to line number lookup.
pub(crate) struct LineIndex {
    newlines: Vec<usize>,
}

impl LineIndex {
    pub(crate) fn new(text: &str) -> Self {
        Self {
            newlines: text
                .bytes()
                .enumerate()
                .filter(|(_, b)| *b == b'\n')
                .map(|(i, _)| i)
                .collect(),
        }
    }

    pub(crate) fn line_of(&self, offset: usize) -> usize {
        self.newlines.partition_point(|&nl| nl < offset) + 1
    }
}
