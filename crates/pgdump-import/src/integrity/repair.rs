//! Mechanical repair of truncated dumps.
//!
//! Repairs only close syntax or delete fragments; they never invent data.
//! The result is new text: callers re-parse it to get a fresh
//! [`ParsedSqlFile`].

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::parser::lexer::{self, OpenConstruct, Unterminated};
use crate::parser::{skip_quoted, ParsedSqlFile};

static INSERT_VALUES: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^INSERT\s+INTO\s+.*?\bVALUES\b").unwrap());

/// Which repairs to attempt.
///
/// With both flags set, closing is tried first and dropping is the fallback.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairMode {
    pub skip_incomplete: bool,
    pub auto_close: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairResult {
    pub success: bool,
    pub repaired_content: String,
    pub repairs_applied: Vec<String>,
}

impl RepairResult {
    /// Parse the repaired text.
    pub fn reparse(&self) -> ParsedSqlFile {
        ParsedSqlFile::parse(&self.repaired_content)
    }
}

/// Repair `text`, whose parse is `parsed`.
pub fn repair(text: &str, parsed: &ParsedSqlFile, mode: RepairMode) -> RepairResult {
    let open = match lexer::split(text).unterminated {
        Some(open) if parsed.metadata.incomplete_statement.is_some() => open,
        _ => {
            return RepairResult {
                success: true,
                repaired_content: text.to_string(),
                repairs_applied: Vec::new(),
            };
        }
    };

    let line = parsed
        .metadata
        .incomplete_statement
        .as_ref()
        .map(|s| s.line)
        .unwrap_or(0);
    let table = parsed
        .metadata
        .truncated_table_name
        .clone()
        .unwrap_or_else(|| "unknown table".to_string());

    if mode.auto_close {
        if let Some((content, note)) = auto_close(text, &open, &table, line) {
            info!("Repair: {}", note);
            return RepairResult {
                success: true,
                repaired_content: content,
                repairs_applied: vec![note],
            };
        }
        warn!("Auto-close could not produce a terminated statement at line {}", line);
    }

    if mode.skip_incomplete {
        let note = format!(
            "Removed incomplete statement at line {} ({} bytes)",
            line,
            text.len() - open.start
        );
        info!("Repair: {}", note);
        return RepairResult {
            success: true,
            repaired_content: text[..open.start].to_string(),
            repairs_applied: vec![note],
        };
    }

    RepairResult {
        success: false,
        repaired_content: text.to_string(),
        repairs_applied: Vec::new(),
    }
}

fn auto_close(text: &str, open: &Unterminated, table: &str, line: usize) -> Option<(String, String)> {
    let (content, note) = match open.open {
        OpenConstruct::CopyData => {
            let data_start = open.copy_data_start.unwrap_or(text.len()).min(text.len());
            let keep_end = if text.ends_with('\n') {
                text.len()
            } else {
                text[data_start..]
                    .rfind('\n')
                    .map(|i| data_start + i + 1)
                    .unwrap_or(data_start)
            };
            let dropped = keep_end < text.len();
            let mut content = text[..keep_end].to_string();
            if !content.ends_with('\n') {
                content.push('\n');
            }
            content.push_str("\\.\n");
            let note = if dropped {
                format!("Closed COPY block for {} (dropped partial last row)", table)
            } else {
                format!("Closed COPY block for {}", table)
            };
            (content, note)
        }
        _ => {
            let fragment = &text[open.start..];
            match last_complete_tuple_end(fragment) {
                Some((end, rows)) => {
                    let mut content = text[..open.start + end].to_string();
                    content.push_str(";\n");
                    let note = format!(
                        "Cut INSERT into {} back to {} complete row(s) and terminated it",
                        table, rows
                    );
                    (content, note)
                }
                None => {
                    let mut content = text.to_string();
                    content.push_str(&open.closer);
                    content.push('\n');
                    let note = format!(
                        "Closed {} and terminated the statement at line {}",
                        open.open.describe(),
                        line
                    );
                    (content, note)
                }
            }
        }
    };

    if lexer::split(&content).unterminated.is_some() {
        return None;
    }
    Some((content, note))
}

/// End offset and count of complete top-level VALUES tuples in an
/// unterminated INSERT.
fn last_complete_tuple_end(fragment: &str) -> Option<(usize, usize)> {
    let m = INSERT_VALUES.find(fragment)?;
    let bytes = fragment.as_bytes();
    let mut i = m.end();
    let mut depth = 0usize;
    let mut last = None;
    let mut rows = 0usize;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => {
                i = skip_quoted(bytes, i, b'\'');
                continue;
            }
            b'"' => {
                i = skip_quoted(bytes, i, b'"');
                continue;
            }
            b'(' => depth += 1,
            b')' if depth > 0 => {
                depth -= 1;
                if depth == 0 {
                    rows += 1;
                    last = Some(i + 1);
                }
            }
            _ => {}
        }
        i += 1;
    }
    last.map(|end| (end, rows))
}
