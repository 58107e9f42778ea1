//! Database error classification.
//!
//! Maps the raw error text (and SQLSTATE, when the channel reports one) to a
//! closed set of categories with stable numeric codes. Classification is a
//! pure function and always returns a result; [`ErrorCategory::Unknown`] is
//! the fallback.

use std::collections::BTreeMap;
use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// How bad an execution error is for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ErrorSeverity {
    Warning,
    Error,
    /// No further statement can succeed.
    Fatal,
    /// The target's data may be damaged.
    Panic,
}

impl ErrorSeverity {
    /// Whether the session must stop regardless of stop-on-first-error.
    pub fn is_session_fatal(&self) -> bool {
        matches!(self, ErrorSeverity::Fatal | ErrorSeverity::Panic)
    }
}

impl fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorSeverity::Warning => "warning",
            ErrorSeverity::Error => "error",
            ErrorSeverity::Fatal => "fatal",
            ErrorSeverity::Panic => "panic",
        };
        f.write_str(s)
    }
}

/// Error categories. The numeric codes are part of the report format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCategory {
    ConnectionRefused,
    AuthenticationFailed,
    DatabaseNotFound,
    PermissionDenied,
    ObjectNotFound,
    DependencyMissing,
    CircularDependency,
    InvalidDefinition,
    DataCorruption,
    EncodingMismatch,
    ConstraintViolation,
    TypeMismatch,
    DiskFull,
    MemoryExhausted,
    TimeoutExceeded,
    LockConflict,
    InvalidSyntax,
    UnbalancedQuotes,
    TruncatedOutput,
    EncodingError,
    RlsViolation,
    Unknown,
}

impl ErrorCategory {
    pub const SYNTAX_ERROR: ErrorCategory = ErrorCategory::InvalidSyntax;
    pub const MISSING_DEPENDENCY: ErrorCategory = ErrorCategory::DependencyMissing;
    pub const TIMEOUT: ErrorCategory = ErrorCategory::TimeoutExceeded;
    pub const CONNECTION_ERROR: ErrorCategory = ErrorCategory::ConnectionRefused;

    pub fn code(&self) -> u16 {
        match self {
            ErrorCategory::ConnectionRefused => 101,
            ErrorCategory::AuthenticationFailed => 102,
            ErrorCategory::DatabaseNotFound => 103,
            ErrorCategory::PermissionDenied => 104,
            ErrorCategory::ObjectNotFound => 201,
            ErrorCategory::DependencyMissing => 202,
            ErrorCategory::CircularDependency => 203,
            ErrorCategory::InvalidDefinition => 204,
            ErrorCategory::DataCorruption => 301,
            ErrorCategory::EncodingMismatch => 302,
            ErrorCategory::ConstraintViolation => 303,
            ErrorCategory::TypeMismatch => 304,
            ErrorCategory::DiskFull => 401,
            ErrorCategory::MemoryExhausted => 402,
            ErrorCategory::TimeoutExceeded => 403,
            ErrorCategory::LockConflict => 404,
            ErrorCategory::InvalidSyntax => 501,
            ErrorCategory::UnbalancedQuotes => 502,
            ErrorCategory::TruncatedOutput => 503,
            ErrorCategory::EncodingError => 504,
            ErrorCategory::RlsViolation => 601,
            ErrorCategory::Unknown => 900,
        }
    }

    pub fn from_code(code: u16) -> Option<Self> {
        ALL_CATEGORIES.iter().copied().find(|c| c.code() == code)
    }

    pub fn default_severity(&self) -> ErrorSeverity {
        match self {
            ErrorCategory::ConnectionRefused
            | ErrorCategory::AuthenticationFailed
            | ErrorCategory::DatabaseNotFound
            | ErrorCategory::DiskFull
            | ErrorCategory::MemoryExhausted => ErrorSeverity::Fatal,
            ErrorCategory::DataCorruption => ErrorSeverity::Panic,
            _ => ErrorSeverity::Error,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ErrorCategory::ConnectionRefused => "CONNECTION_REFUSED",
            ErrorCategory::AuthenticationFailed => "AUTHENTICATION_FAILED",
            ErrorCategory::DatabaseNotFound => "DATABASE_NOT_FOUND",
            ErrorCategory::PermissionDenied => "PERMISSION_DENIED",
            ErrorCategory::ObjectNotFound => "OBJECT_NOT_FOUND",
            ErrorCategory::DependencyMissing => "DEPENDENCY_MISSING",
            ErrorCategory::CircularDependency => "CIRCULAR_DEPENDENCY",
            ErrorCategory::InvalidDefinition => "INVALID_DEFINITION",
            ErrorCategory::DataCorruption => "DATA_CORRUPTION",
            ErrorCategory::EncodingMismatch => "ENCODING_MISMATCH",
            ErrorCategory::ConstraintViolation => "CONSTRAINT_VIOLATION",
            ErrorCategory::TypeMismatch => "TYPE_MISMATCH",
            ErrorCategory::DiskFull => "DISK_FULL",
            ErrorCategory::MemoryExhausted => "MEMORY_EXHAUSTED",
            ErrorCategory::TimeoutExceeded => "TIMEOUT_EXCEEDED",
            ErrorCategory::LockConflict => "LOCK_CONFLICT",
            ErrorCategory::InvalidSyntax => "INVALID_SYNTAX",
            ErrorCategory::UnbalancedQuotes => "UNBALANCED_QUOTES",
            ErrorCategory::TruncatedOutput => "TRUNCATED_OUTPUT",
            ErrorCategory::EncodingError => "ENCODING_ERROR",
            ErrorCategory::RlsViolation => "RLS_VIOLATION",
            ErrorCategory::Unknown => "UNKNOWN",
        }
    }

    /// The target cannot be reached or used at all.
    pub fn is_connection_level(&self) -> bool {
        matches!(
            self,
            ErrorCategory::ConnectionRefused
                | ErrorCategory::AuthenticationFailed
                | ErrorCategory::DatabaseNotFound
        )
    }

    /// Failures worth retrying after a pause.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ErrorCategory::TimeoutExceeded
                | ErrorCategory::LockConflict
                | ErrorCategory::ConnectionRefused
        )
    }

    /// Failures a dry run treats as grounds to abort.
    pub fn is_syntax_level(&self) -> bool {
        matches!(
            self,
            ErrorCategory::InvalidSyntax
                | ErrorCategory::UnbalancedQuotes
                | ErrorCategory::TruncatedOutput
        )
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.code())
    }
}

const ALL_CATEGORIES: [ErrorCategory; 22] = [
    ErrorCategory::ConnectionRefused,
    ErrorCategory::AuthenticationFailed,
    ErrorCategory::DatabaseNotFound,
    ErrorCategory::PermissionDenied,
    ErrorCategory::ObjectNotFound,
    ErrorCategory::DependencyMissing,
    ErrorCategory::CircularDependency,
    ErrorCategory::InvalidDefinition,
    ErrorCategory::DataCorruption,
    ErrorCategory::EncodingMismatch,
    ErrorCategory::ConstraintViolation,
    ErrorCategory::TypeMismatch,
    ErrorCategory::DiskFull,
    ErrorCategory::MemoryExhausted,
    ErrorCategory::TimeoutExceeded,
    ErrorCategory::LockConflict,
    ErrorCategory::InvalidSyntax,
    ErrorCategory::UnbalancedQuotes,
    ErrorCategory::TruncatedOutput,
    ErrorCategory::EncodingError,
    ErrorCategory::RlsViolation,
    ErrorCategory::Unknown,
];

/// Category and severity assigned to one error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Classification {
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
}

impl Classification {
    fn of(category: ErrorCategory) -> Self {
        Self {
            category,
            severity: category.default_severity(),
        }
    }

    pub fn code(&self) -> u16 {
        self.category.code()
    }
}

struct Rule {
    pattern: Regex,
    category: ErrorCategory,
    severity: Option<ErrorSeverity>,
}

fn rule(pattern: &str, category: ErrorCategory) -> Rule {
    Rule {
        pattern: Regex::new(&format!("(?i){}", pattern)).unwrap(),
        category,
        severity: None,
    }
}

// First match wins.
static RULES: Lazy<Vec<Rule>> = Lazy::new(|| {
    use ErrorCategory::*;
    vec![
        rule(r"could not connect to server|connection refused|connection reset|server closed the connection|terminating connection|could not translate host name|no route to host", ConnectionRefused),
        rule(r"password authentication failed|authentication failed|no pg_hba\.conf entry", AuthenticationFailed),
        rule(r#"database "?[^"\s]+"? does not exist"#, DatabaseNotFound),
        rule(r"violates row-level security policy", RlsViolation),
        rule(r"permission denied|must be owner of|must be superuser", PermissionDenied),
        Rule {
            severity: Some(ErrorSeverity::Warning),
            ..rule(r"current transaction is aborted", ConstraintViolation)
        },
        rule(r"violates (?:foreign key|unique|check|not-null|exclusion) constraint|duplicate key value", ConstraintViolation),
        rule(r"(?:relation|table|type|function|schema|column|sequence|index) .* does not exist", ObjectNotFound),
        rule(r"is not present in table|is still referenced from|dependent objects still exist|depends? on", DependencyMissing),
        rule(r"infinite recursion|circular (?:reference|dependency)", CircularDependency),
        rule(r"invalid input syntax for (?:type )?|value too long for type|out of range|invalid input value for enum|cannot be cast|is of type .* but expression is of type", TypeMismatch),
        rule(r"could not read block|checksum mismatch|invalid page|corrupt", DataCorruption),
        rule(r"invalid byte sequence for encoding|character with byte sequence .* has no equivalent", EncodingMismatch),
        rule(r"no space left on device|could not extend file", DiskFull),
        rule(r"out of memory|cannot allocate memory", MemoryExhausted),
        rule(r"statement timeout|canceling statement due to|timeout expired|timed out", TimeoutExceeded),
        rule(r"deadlock detected|could not obtain lock|lock timeout|lock not available", LockConflict),
        rule(r"unterminated quoted (?:string|identifier)|unterminated dollar-quoted string", UnbalancedQuotes),
        rule(r"unexpected end of (?:file|input)|syntax error at end of input", TruncatedOutput),
        rule(r"syntax error at or near|syntax error", InvalidSyntax),
        rule(r"already exists|cannot alter type|invalid .* definition|multiple primary keys", InvalidDefinition),
        rule(r"invalid utf-?8|unicode escape|encoding", EncodingError),
    ]
});

/// Classify a raw error message.
pub fn classify_error(message: &str) -> Classification {
    classify(None, message)
}

/// Classify a raw error, consulting the SQLSTATE first when available.
pub fn classify(sqlstate: Option<&str>, message: &str) -> Classification {
    if let Some(category) = sqlstate.and_then(|s| from_sqlstate(s, message)) {
        let severity = if sqlstate == Some("25P02") {
            ErrorSeverity::Warning
        } else {
            category.default_severity()
        };
        return Classification { category, severity };
    }

    RULES
        .iter()
        .find(|r| r.pattern.is_match(message))
        .map(|r| Classification {
            category: r.category,
            severity: r.severity.unwrap_or_else(|| r.category.default_severity()),
        })
        .unwrap_or_else(|| Classification::of(ErrorCategory::Unknown))
}

fn from_sqlstate(code: &str, message: &str) -> Option<ErrorCategory> {
    use ErrorCategory::*;
    let category = match code {
        "28000" | "28P01" => AuthenticationFailed,
        "3D000" => DatabaseNotFound,
        "42501" if message.to_lowercase().contains("row-level security") => RlsViolation,
        "42501" => PermissionDenied,
        "42P01" | "42704" | "42883" | "3F000" | "42703" => ObjectNotFound,
        "2BP01" => DependencyMissing,
        "42P07" | "42710" | "42P06" | "42P16" | "42P17" | "42611" => InvalidDefinition,
        "22P02" | "22003" | "22001" | "22007" | "22008" | "42804" | "22P05" => TypeMismatch,
        "22021" => EncodingMismatch,
        "42601" => InvalidSyntax,
        "57014" => TimeoutExceeded,
        "40P01" | "55P03" => LockConflict,
        "53100" => DiskFull,
        "53200" => MemoryExhausted,
        "XX001" | "XX002" => DataCorruption,
        "25P02" => ConstraintViolation,
        c if c.starts_with("08") => ConnectionRefused,
        c if c.starts_with("23") => ConstraintViolation,
        _ => return None,
    };
    Some(category)
}

/// Occurrences per category, for the operator summary.
pub fn summarize<I>(categories: I) -> BTreeMap<ErrorCategory, usize>
where
    I: IntoIterator<Item = ErrorCategory>,
{
    let mut counts = BTreeMap::new();
    for category in categories {
        *counts.entry(category).or_insert(0) += 1;
    }
    counts
}
