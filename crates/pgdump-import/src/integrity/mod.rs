//! Integrity checks over raw dump text.
//!
//! [`check_file_integrity`] looks for truncation and corruption signatures
//! before (and independent of) a full parse. Mechanical fixes are offered as
//! [`RepairSuggestion`]s and applied by [`repair`].

mod repair;

pub use repair::{repair, RepairMode, RepairResult};

use std::collections::BTreeSet;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::identifier::TableRef;
use crate::parser::lexer::{self, OpenConstruct};
use crate::parser::{truncate_text, LineIndex};

static DATA_SECTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?m)^--\s*Data for Name:\s*([^;]+);\s*Type:\s*TABLE DATA;\s*Schema:\s*([^;]+);")
        .unwrap()
});
static DATA_TARGET: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^(?:INSERT\s+INTO|COPY)\s+").unwrap());
static DUMP_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^--\s*PostgreSQL database dump\s*$").unwrap());
static DUMP_COMPLETE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?m)^--\s*PostgreSQL database dump complete").unwrap());

/// Share of replacement characters above which text is treated as binary.
const BINARY_REPLACEMENT_RATIO: f64 = 0.01;

const CONTEXT_CHARS: usize = 120;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Error,
    Warning,
    Info,
}

/// A problem found in the dump before execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityIssue {
    pub severity: IssueSeverity,
    pub description: String,
    pub line_number: Option<usize>,
    pub affected_table: Option<String>,
    /// Snippet of the offending text.
    pub context: Option<String>,
}

impl IntegrityIssue {
    fn new(severity: IssueSeverity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
            line_number: None,
            affected_table: None,
            context: None,
        }
    }

    fn at_line(mut self, line: usize) -> Self {
        self.line_number = Some(line);
        self
    }

    fn table(mut self, table: Option<String>) -> Self {
        self.affected_table = table;
        self
    }

    fn context(mut self, context: &str) -> Self {
        self.context = Some(truncate_text(context, CONTEXT_CHARS));
        self
    }
}

/// Mechanical fix the repair engine can apply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepairAction {
    SkipIncomplete,
    AutoClose,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSuggestion {
    pub description: String,
    pub automatable: bool,
    /// The repair mode that carries it out, when automatable.
    pub action: Option<RepairAction>,
}

impl RepairSuggestion {
    fn automatic(description: impl Into<String>, action: RepairAction) -> Self {
        Self {
            description: description.into(),
            automatable: true,
            action: Some(action),
        }
    }

    fn manual(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            automatable: false,
            action: None,
        }
    }
}

/// Outcome of [`check_file_integrity`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub is_likely_complete: bool,
    pub issues: Vec<IntegrityIssue>,
    pub suggestions: Vec<RepairSuggestion>,
}

impl IntegrityReport {
    pub fn has_errors(&self) -> bool {
        self.issues.iter().any(|i| i.severity == IssueSeverity::Error)
    }
}

/// Inspect dump text for truncation and corruption.
///
/// `byte_size` is the size of the source the text was decoded from; a
/// mismatch with the decoded length means bytes were lost or replaced.
pub fn check_file_integrity(text: &str, byte_size: u64) -> IntegrityReport {
    let mut report = IntegrityReport::default();

    if text.trim().is_empty() {
        report
            .issues
            .push(IntegrityIssue::new(IssueSeverity::Error, "File is empty"));
        return report;
    }

    check_encoding(text, byte_size, &mut report);

    let lex = lexer::split(text);
    let lines = LineIndex::new(text);

    if let Some(open) = &lex.unterminated {
        let fragment = &text[open.start..];
        let table = DATA_TARGET
            .find(fragment)
            .and_then(|m| TableRef::parse(&fragment[m.end()..]))
            .map(|t| t.qualified());
        let line = lines.line_of(open.start);

        if open.open == OpenConstruct::CopyData {
            report.issues.push(
                IntegrityIssue::new(
                    IssueSeverity::Error,
                    format!(
                        "COPY block{} ends without the \\. terminator; the data was cut off",
                        table.as_deref().map(|t| format!(" for {}", t)).unwrap_or_default()
                    ),
                )
                .at_line(line)
                .table(table)
                .context(tail(fragment)),
            );
            report.suggestions.push(RepairSuggestion::automatic(
                "Terminate the COPY block, dropping the partial last row",
                RepairAction::AutoClose,
            ));
            report.suggestions.push(RepairSuggestion::automatic(
                "Drop the incomplete COPY block",
                RepairAction::SkipIncomplete,
            ));
        } else {
            report.issues.push(
                IntegrityIssue::new(
                    IssueSeverity::Error,
                    format!("File ends mid-statement ({})", open.open.describe()),
                )
                .at_line(line)
                .table(table)
                .context(tail(fragment)),
            );
            report.suggestions.push(RepairSuggestion::automatic(
                "Remove the incomplete final statement",
                RepairAction::SkipIncomplete,
            ));
            report.suggestions.push(RepairSuggestion::automatic(
                "Close open quotes and parentheses and terminate the final statement",
                RepairAction::AutoClose,
            ));
        }
    }

    check_data_sections(text, &lex, &lines, &mut report);

    let is_pg_dump = DUMP_HEADER.is_match(text);
    let has_marker = DUMP_COMPLETE.is_match(text);
    if !has_marker {
        let severity = if is_pg_dump {
            IssueSeverity::Warning
        } else {
            IssueSeverity::Info
        };
        report.issues.push(IntegrityIssue::new(
            severity,
            "pg_dump completion marker not found; the file may be truncated",
        ));
        if is_pg_dump {
            report.suggestions.push(RepairSuggestion::manual(
                "Re-export the database and compare file sizes",
            ));
        }
    }

    report.is_likely_complete =
        !report.has_errors() && lex.unterminated.is_none() && (has_marker || !is_pg_dump);
    report
}

fn check_encoding(text: &str, byte_size: u64, report: &mut IntegrityReport) {
    let nul_count = text.bytes().filter(|b| *b == 0).count();
    if nul_count > 0 {
        report.issues.push(IntegrityIssue::new(
            IssueSeverity::Error,
            format!(
                "File contains binary data ({} NUL bytes); it is not a plain-text SQL dump",
                nul_count
            ),
        ));
        report.suggestions.push(RepairSuggestion::manual(
            "Export with pg_dump --format=plain, or restore custom-format archives with pg_restore",
        ));
    }

    let replaced = text.chars().filter(|c| *c == char::REPLACEMENT_CHARACTER).count();
    if replaced > 0 {
        let ratio = replaced as f64 / text.chars().count().max(1) as f64;
        let severity = if ratio > BINARY_REPLACEMENT_RATIO {
            IssueSeverity::Error
        } else {
            IssueSeverity::Warning
        };
        report.issues.push(IntegrityIssue::new(
            severity,
            format!(
                "{} invalid UTF-8 sequence(s) were replaced while decoding",
                replaced
            ),
        ));
        report.suggestions.push(RepairSuggestion::manual(
            "Re-export with --encoding=UTF8",
        ));
    }

    let decoded = text.len() as u64;
    if decoded != byte_size {
        report.issues.push(IntegrityIssue::new(
            IssueSeverity::Warning,
            format!(
                "Source is {} bytes but {} bytes were decoded; the file may have been re-encoded or read short",
                byte_size, decoded
            ),
        ));
    }
}

/// pg_dump announces each table's data with a `Data for Name` comment; a
/// section with no INSERT/COPY for the table points at a cut-off file.
fn check_data_sections(
    text: &str,
    lex: &lexer::LexOutput,
    lines: &LineIndex,
    report: &mut IntegrityReport,
) {
    let loaded: BTreeSet<String> = lex
        .statements
        .iter()
        .filter_map(|s| {
            let body = &text[s.span.clone()];
            DATA_TARGET
                .find(body)
                .and_then(|m| TableRef::parse(&body[m.end()..]))
        })
        .map(|t| t.qualified())
        .collect();

    for caps in DATA_SECTION.captures_iter(text) {
        let schema = caps[2].trim();
        let name = caps[1].trim();
        let qualified = TableRef::parse(&format!("{}.{}", schema, name))
            .map(|t| t.qualified())
            .unwrap_or_else(|| format!("{}.{}", schema, name));
        if loaded.contains(&qualified) {
            continue;
        }
        let offset = caps.get(0).map(|m| m.start()).unwrap_or(0);
        report.issues.push(
            IntegrityIssue::new(
                IssueSeverity::Warning,
                format!(
                    "Data section for {} is declared but no rows follow; the file may be truncated",
                    qualified
                ),
            )
            .at_line(lines.line_of(offset))
            .table(Some(qualified)),
        );
    }
}

fn tail(fragment: &str) -> &str {
    let count = fragment.chars().count();
    if count <= CONTEXT_CHARS {
        return fragment;
    }
    let skip = count - CONTEXT_CHARS;
    let start = fragment
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    &fragment[start..]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clean_dump_is_complete() {
        let text = "--\n-- PostgreSQL database dump\n--\nSELECT 1;\n--\n-- PostgreSQL database dump complete\n--\n";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(report.is_likely_complete);
        assert!(report.issues.is_empty());
    }

    #[test]
    fn test_plain_sql_without_marker_is_info_only() {
        let text = "CREATE TABLE t(id int);\n";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(report.is_likely_complete);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, IssueSeverity::Info);
    }

    #[test]
    fn test_pg_dump_missing_marker_warns() {
        let text = "--\n-- PostgreSQL database dump\n--\nSELECT 1;\n";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(!report.is_likely_complete);
        assert_eq!(report.issues[0].severity, IssueSeverity::Warning);
    }

    #[test]
    fn test_mid_statement_truncation() {
        let text = "CREATE TABLE t(id int);\nINSERT INTO t VALUES (1";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(!report.is_likely_complete);
        let issue = &report.issues[0];
        assert_eq!(issue.severity, IssueSeverity::Error);
        assert_eq!(issue.line_number, Some(2));
        assert_eq!(issue.affected_table.as_deref(), Some("public.t"));
        assert!(issue.context.as_deref().unwrap().contains("VALUES (1"));
        assert!(report
            .suggestions
            .iter()
            .any(|s| s.automatable && s.action == Some(RepairAction::SkipIncomplete)));
    }

    #[test]
    fn test_copy_truncation() {
        let text = "COPY public.t (id) FROM stdin;\n1\n2";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(report.issues[0].description.contains("COPY block for public.t"));
        assert_eq!(report.suggestions[0].action, Some(RepairAction::AutoClose));
    }

    #[test]
    fn test_binary_content() {
        let text = "SELECT 1;\0\0\0";
        let report = check_file_integrity(text, text.len() as u64);
        assert!(report.has_errors());
        assert!(report.issues[0].description.contains("binary"));
    }

    #[test]
    fn test_size_mismatch() {
        let text = "SELECT 1;\n";
        let report = check_file_integrity(text, 4096);
        assert!(report
            .issues
            .iter()
            .any(|i| i.severity == IssueSeverity::Warning && i.description.contains("4096")));
    }

    #[test]
    fn test_declared_data_section_without_rows() {
        let text = "--\n-- Data for Name: users; Type: TABLE DATA; Schema: public; Owner: app\n--\n\nCOPY public.orders (id) FROM stdin;\n1\n\\.\n";
        let report = check_file_integrity(text, text.len() as u64);
        let issue = report
            .issues
            .iter()
            .find(|i| i.description.contains("public.users"))
            .unwrap();
        assert_eq!(issue.line_number, Some(2));
    }

    #[test]
    fn test_empty_file() {
        let report = check_file_integrity("  \n", 3);
        assert!(report.has_errors());
        assert!(!report.is_likely_complete);
    }
}
