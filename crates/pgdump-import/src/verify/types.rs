//! Type definitions for post-import verification.

use serde::{Deserialize, Serialize};

use crate::core::identifier::TableRef;

/// Foreign-key orphan summary for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrphanCheck {
    pub has_orphans: bool,
    /// Child rows whose reference does not resolve, summed over all FKs.
    pub orphan_count: i64,
    /// Names of the offending constraints, joined with `, `.
    pub constraint_name: String,
}

/// Verification outcome for a single table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    /// Table name as supplied in the expected counts.
    pub table: String,
    pub expected: i64,
    /// Actual row count, `-1` when the count query failed.
    pub actual: i64,
    /// Order-independent digest of the table contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
    #[serde(rename = "match")]
    pub matches: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub orphan_check: Option<OrphanCheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl VerificationResult {
    pub(crate) fn pending(table: &str, expected: i64) -> Self {
        Self {
            table: table.to_string(),
            expected,
            actual: -1,
            checksum: None,
            matches: false,
            orphan_check: None,
            error: None,
            duration_ms: 0,
        }
    }

    /// Count differs from the expectation by this many rows.
    pub fn difference(&self) -> i64 {
        self.actual - self.expected
    }
}

/// A foreign key as declared in `pg_constraint`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForeignKey {
    pub name: String,
    pub child: TableRef,
    pub child_columns: Vec<String>,
    pub parent: TableRef,
    pub parent_columns: Vec<String>,
}

/// Progress update sent while tables are verified.
#[derive(Debug, Clone)]
pub struct VerifyProgressUpdate {
    /// Table that just finished.
    pub table: String,
    pub tables_total: usize,
    pub tables_completed: usize,
    pub mismatches_found: usize,
}
