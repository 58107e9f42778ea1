//! Execution channel: the boundary between the import engine and the target.
//!
//! The engine never talks to a driver directly. Everything it needs from the
//! target database goes through [`ExecutionChannel`], which keeps the
//! scheduling logic testable against an in-memory fake and lets hosts supply
//! their own transport.

pub mod conflict;
pub mod postgres;
pub mod tls;

use std::collections::BTreeMap;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::{ConnectionConfig, OnConflict};
use crate::error::Result;

pub use postgres::PgChannel;
pub use tls::{SslMode, TlsBuilder};

/// Failed statement text is cut to this many characters in results.
pub const MAX_STATEMENT_PREVIEW: usize = 200;

static COPY_HEADER: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^\s*COPY\s+.+?\s+FROM\s+stdin\b").unwrap());

/// Flags for one [`ExecutionChannel::execute`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    /// Wrap the batch in BEGIN/COMMIT.
    pub transactional: bool,
    /// Validate only; every change is rolled back.
    pub dry_run: bool,
    /// Stop at the first failing statement. In a transactional batch this
    /// also rolls back the statements that already ran.
    pub stop_on_error: bool,
    /// Row-level conflict policy for INSERT statements.
    pub on_conflict: OnConflict,
}

/// What happened to one statement of a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum StatementStatus {
    Executed,
    Failed {
        /// Statement text, truncated.
        statement: String,
        error: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sqlstate: Option<String>,
    },
    /// Ran successfully but was undone with its transaction.
    RolledBack,
    /// Never sent because an earlier statement failed.
    Skipped,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatementOutcome {
    /// Position within the batch.
    pub index: usize,
    #[serde(flatten)]
    pub status: StatementStatus,
}

/// Result of one batch.
///
/// `results` is empty when the batch failed before any statement ran, in
/// which case `error` carries the reason.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecuteResult {
    pub success: bool,
    pub results: Vec<StatementOutcome>,
    pub error: Option<String>,
}

impl ExecuteResult {
    /// A batch that failed as a whole.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            results: Vec::new(),
            error: Some(error.into()),
        }
    }

    pub fn failures(&self) -> impl Iterator<Item = &StatementOutcome> {
        self.results
            .iter()
            .filter(|r| matches!(r.status, StatementStatus::Failed { .. }))
    }
}

/// One row of a read-only query, every value in its text form.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryRow(pub BTreeMap<String, Option<String>>);

impl QueryRow {
    pub fn get(&self, column: &str) -> Option<&str> {
        self.0.get(column).and_then(|v| v.as_deref())
    }

    pub fn get_i64(&self, column: &str) -> Option<i64> {
        self.get(column).and_then(|v| v.trim().parse().ok())
    }

    pub fn get_bool(&self, column: &str) -> Option<bool> {
        match self.get(column)? {
            "t" | "true" | "TRUE" | "1" => Some(true),
            "f" | "false" | "FALSE" | "0" => Some(false),
            _ => None,
        }
    }

    pub fn is_null(&self, column: &str) -> bool {
        self.get(column).is_none()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, Option<V>)> for QueryRow {
    fn from_iter<I: IntoIterator<Item = (K, Option<V>)>>(iter: I) -> Self {
        QueryRow(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.map(Into::into)))
                .collect(),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryResult {
    pub rows: Vec<QueryRow>,
}

impl QueryResult {
    pub fn first(&self) -> Option<&QueryRow> {
        self.rows.first()
    }
}

/// Server details reported by a successful connection test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub version: String,
    pub database: String,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionTestResult {
    pub success: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
}

/// Capability to run SQL against a target database.
///
/// Implementations must be safe to share across tasks. Statement failures
/// are reported inside [`ExecuteResult`]; an `Err` means the channel itself
/// could not be used (no connection, pool exhausted, etc.).
#[async_trait]
pub trait ExecutionChannel: Send + Sync {
    /// Run a batch of statements in order.
    async fn execute(
        &self,
        connection: &ConnectionConfig,
        statements: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult>;

    /// Run one read-only query and return its rows as text.
    async fn query(&self, connection: &ConnectionConfig, sql: &str) -> Result<QueryResult>;

    /// Check that the target is reachable with the given credentials.
    async fn test_connection(&self, connection: &ConnectionConfig) -> ConnectionTestResult;
}

/// Split a `COPY ... FROM stdin;` statement carrying inline data into its
/// header (without the terminator) and its data lines.
pub(crate) fn split_copy(text: &str) -> Option<(&str, &str)> {
    if !COPY_HEADER.is_match(text) {
        return None;
    }
    let mut offset = 0;
    for line in text.split_inclusive('\n') {
        offset += line.len();
        if line.trim_end().ends_with(';') {
            let header = text[..offset].trim_end().trim_end_matches(';').trim_end();
            let rest = &text[offset..];
            let data = match rest.rfind("\\.") {
                Some(end) if rest[end..].trim() == "\\." => &rest[..end],
                _ => rest,
            };
            return Some((header, data));
        }
    }
    None
}

pub(crate) fn preview(text: &str) -> String {
    crate::parser::truncate_text(text, MAX_STATEMENT_PREVIEW)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_copy() {
        let text = "COPY public.t (id, name) FROM stdin;\n1\ta\n2\tb\n\\.";
        let (header, data) = split_copy(text).unwrap();
        assert_eq!(header, "COPY public.t (id, name) FROM stdin");
        assert_eq!(data, "1\ta\n2\tb\n");
    }

    #[test]
    fn test_split_copy_ignores_other_statements() {
        assert!(split_copy("INSERT INTO t VALUES (1);").is_none());
        assert!(split_copy("COPY t TO stdout;").is_none());
    }

    #[test]
    fn test_query_row_accessors() {
        let row: QueryRow = vec![
            ("n", Some("42")),
            ("flag", Some("t")),
            ("missing", None),
        ]
        .into_iter()
        .collect();
        assert_eq!(row.get_i64("n"), Some(42));
        assert_eq!(row.get_bool("flag"), Some(true));
        assert!(row.is_null("missing"));
        assert!(row.is_null("absent"));
    }

    #[test]
    fn test_statement_outcome_serialization() {
        let outcome = StatementOutcome {
            index: 1,
            status: StatementStatus::Failed {
                statement: "INSERT".into(),
                error: "boom".into(),
                sqlstate: None,
            },
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["status"], "failed");
        assert_eq!(json["index"], 1);
        assert_eq!(json["error"], "boom");
    }
}
