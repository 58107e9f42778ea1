//! Statement kind classification and target extraction.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::identifier::TableRef;

/// What a statement does, decided by its leading keywords.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StatementKind {
    SchemaDdl,
    TableDdl,
    DataDml,
    Constraint,
    Index,
    Function,
    Policy,
    Trigger,
    Enum,
}

impl StatementKind {
    pub const ALL: [StatementKind; 9] = [
        StatementKind::SchemaDdl,
        StatementKind::TableDdl,
        StatementKind::DataDml,
        StatementKind::Constraint,
        StatementKind::Index,
        StatementKind::Function,
        StatementKind::Policy,
        StatementKind::Trigger,
        StatementKind::Enum,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            StatementKind::SchemaDdl => "schema-ddl",
            StatementKind::TableDdl => "table-ddl",
            StatementKind::DataDml => "data-dml",
            StatementKind::Constraint => "constraint",
            StatementKind::Index => "index",
            StatementKind::Function => "function",
            StatementKind::Policy => "policy",
            StatementKind::Trigger => "trigger",
            StatementKind::Enum => "enum",
        }
    }
}

impl fmt::Display for StatementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of classifying one statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Classified {
    pub kind: StatementKind,
    pub target: Option<TableRef>,
    pub rows: u64,
}

static CREATE_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?is)^CREATE\s+(?:(?:GLOBAL|LOCAL)\s+)?(?:(?:UNLOGGED|TEMP|TEMPORARY)\s+)?TABLE\s+(?:IF\s+NOT\s+EXISTS\s+)?",
    )
    .unwrap()
});
static INSERT_INTO: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)^INSERT\s+INTO\s+").unwrap());
static COPY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)^COPY\s+").unwrap());
static ALTER_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^ALTER\s+TABLE\s+(?:IF\s+EXISTS\s+)?(?:ONLY\s+)?").unwrap()
});
static ADD_CONSTRAINT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)\bADD\s+(?:CONSTRAINT|PRIMARY\s+KEY|FOREIGN\s+KEY|UNIQUE|CHECK|EXCLUDE)\b")
        .unwrap()
});
static CREATE_CONSTRAINT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^CREATE\s+(?:OR\s+REPLACE\s+)?CONSTRAINT\b").unwrap());
static CREATE_INDEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^CREATE\s+(?:UNIQUE\s+)?INDEX\b").unwrap());
static CREATE_FUNCTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?is)^CREATE\s+(?:OR\s+REPLACE\s+)?(?:FUNCTION|PROCEDURE)\b").unwrap()
});
static CREATE_POLICY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)^CREATE\s+POLICY\b").unwrap());
static CREATE_TRIGGER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^CREATE\s+(?:OR\s+REPLACE\s+)?TRIGGER\b").unwrap());
static CREATE_ENUM: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^CREATE\s+TYPE\b.*?\bAS\s+ENUM\b").unwrap());
static ON_TARGET: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?is)\bON\s+(?:ONLY\s+)?").unwrap());
static VALUES: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bVALUES\b").unwrap());

/// `ALTER <object kind> <name>[(<signature>)] OWNER TO`, where the kind is
/// one to three words and the name is a possibly quoted, dotted identifier.
static OWNERSHIP: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r#"(?is)^(?:GRANT\b|REVOKE\b|ALTER\s+DEFAULT\s+PRIVILEGES\b|ALTER\s+(?:[A-Za-z]+\s+){1,3}(?:"(?:[^"]|"")*"|[\w$]+)(?:\s*\.\s*(?:"(?:[^"]|"")*"|[\w$]+))*\s*(?:\([^)']*\))?\s+OWNER\s+TO\b)"#,
    )
    .unwrap()
});
static TUPLES_END: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:ON\s+CONFLICT|RETURNING)\b").unwrap());
static DROP: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^DROP\b").unwrap());
static TRUNCATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)^TRUNCATE\b").unwrap());
static TRANSACTION_CONTROL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(?:BEGIN|COMMIT|START\s+TRANSACTION|END)\b").unwrap());

/// Classify a statement by its first significant keywords.
pub(crate) fn classify(text: &str, copy_rows: Option<u64>) -> Classified {
    let text = text.trim_start();

    if let Some(m) = CREATE_TABLE.find(text) {
        return Classified {
            kind: StatementKind::TableDdl,
            target: TableRef::parse(&text[m.end()..]),
            rows: 0,
        };
    }
    if let Some(m) = INSERT_INTO.find(text) {
        return Classified {
            kind: StatementKind::DataDml,
            target: TableRef::parse(&text[m.end()..]),
            rows: count_value_tuples(text),
        };
    }
    if let Some(m) = COPY.find(text) {
        return Classified {
            kind: StatementKind::DataDml,
            target: TableRef::parse(&text[m.end()..]),
            rows: copy_rows.unwrap_or(0),
        };
    }
    if let Some(m) = ALTER_TABLE.find(text) {
        let kind = if ADD_CONSTRAINT.is_match(text) {
            StatementKind::Constraint
        } else {
            StatementKind::SchemaDdl
        };
        return Classified {
            kind,
            target: TableRef::parse(&text[m.end()..]),
            rows: 0,
        };
    }

    let kind = if CREATE_CONSTRAINT.is_match(text) {
        StatementKind::Constraint
    } else if CREATE_INDEX.is_match(text) {
        StatementKind::Index
    } else if CREATE_FUNCTION.is_match(text) {
        StatementKind::Function
    } else if CREATE_POLICY.is_match(text) {
        StatementKind::Policy
    } else if CREATE_TRIGGER.is_match(text) {
        StatementKind::Trigger
    } else if CREATE_ENUM.is_match(text) {
        StatementKind::Enum
    } else {
        StatementKind::SchemaDdl
    };

    let target = match kind {
        StatementKind::Index
        | StatementKind::Policy
        | StatementKind::Trigger
        | StatementKind::Constraint => ON_TARGET
            .find(text)
            .and_then(|m| TableRef::parse(&text[m.end()..])),
        _ => None,
    };

    Classified {
        kind,
        target,
        rows: 0,
    }
}

/// Count top-level `( ... )` tuples after `VALUES`.
///
/// Counting stops at `ON CONFLICT` or `RETURNING`. `INSERT ... SELECT` and
/// `DEFAULT VALUES` count as zero rows.
pub(crate) fn count_value_tuples(text: &str) -> u64 {
    let Some(m) = VALUES.find(text) else {
        return 0;
    };
    let bytes = text.as_bytes();
    let mut i = m.end();
    let mut depth = 0usize;
    let mut rows = 0u64;
    while i < bytes.len() {
        match bytes[i] {
            b'\'' => i = skip_quoted(bytes, i, b'\''),
            b'"' => i = skip_quoted(bytes, i, b'"'),
            b'(' => {
                if depth == 0 {
                    rows += 1;
                }
                depth += 1;
                i += 1;
            }
            b')' => {
                depth = depth.saturating_sub(1);
                i += 1;
            }
            b';' if depth == 0 => break,
            b if depth == 0
                && b.is_ascii_alphabetic()
                && !is_word_byte(bytes[i - 1])
                && TUPLES_END.is_match(&text[i..]) =>
            {
                break
            }
            _ => i += 1,
        }
    }
    rows
}

fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Index just past the closing quote, doubling as escape.
pub(crate) fn skip_quoted(bytes: &[u8], at: usize, quote: u8) -> usize {
    let escapes = quote == b'\'' && at > 0 && matches!(bytes[at - 1], b'E' | b'e');
    let mut i = at + 1;
    while i < bytes.len() {
        let b = bytes[i];
        if escapes && b == b'\\' {
            i += 2;
        } else if b == quote {
            if bytes.get(i + 1) == Some(&quote) {
                i += 2;
            } else {
                return i + 1;
            }
        } else {
            i += 1;
        }
    }
    bytes.len()
}

pub(crate) fn is_ownership(text: &str) -> bool {
    OWNERSHIP.is_match(text.trim_start())
}

pub(crate) fn is_drop(text: &str) -> bool {
    DROP.is_match(text.trim_start())
}

pub(crate) fn is_truncate(text: &str) -> bool {
    TRUNCATE.is_match(text.trim_start())
}

pub(crate) fn is_transaction_control(text: &str) -> bool {
    TRANSACTION_CONTROL.is_match(text.trim_start())
}
