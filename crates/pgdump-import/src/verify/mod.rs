//! Read-only verification of an imported database.
//!
//! For each table in the expected counts the engine:
//!
//! - counts rows and computes a content checksum in a single scan
//! - compares the checksum with a baseline when one was supplied
//! - counts child rows whose foreign key does not resolve
//!
//! A failed count query is recorded as `actual = -1` with `match = false`
//! rather than aborting the run. No statement issued here writes.

pub mod query;
pub mod types;

pub use types::{ForeignKey, OrphanCheck, VerificationResult, VerifyProgressUpdate};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::stream::{self, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::channel::ExecutionChannel;
use crate::config::{Config, ConnectionConfig};
use crate::core::identifier::TableRef;
use crate::error::{DumpImportError, Result};
use crate::parser::ParsedSqlFile;
use query::{count_checksum_query, foreign_keys_query, orphan_count_query};

const DEFAULT_CONCURRENCY: usize = 4;

/// Engine for post-import verification.
pub struct VerifyEngine {
    channel: Arc<dyn ExecutionChannel>,
    connection: ConnectionConfig,
    concurrency: usize,
    baseline: BTreeMap<String, String>,
    progress_tx: Option<mpsc::Sender<VerifyProgressUpdate>>,
}

impl VerifyEngine {
    pub fn new(channel: Arc<dyn ExecutionChannel>, connection: ConnectionConfig) -> Self {
        Self {
            channel,
            connection,
            concurrency: DEFAULT_CONCURRENCY,
            baseline: BTreeMap::new(),
            progress_tx: None,
        }
    }

    /// Engine for the configured target, verifying
    /// `options.verify_concurrency` tables at once.
    pub fn from_config(channel: Arc<dyn ExecutionChannel>, config: &Config) -> Self {
        Self::new(channel, config.connection.clone())
            .with_concurrency(config.options.verify_concurrency)
    }

    /// Number of tables verified at once.
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Checksums, keyed by `schema.table`, that matching tables must reproduce.
    pub fn with_baseline(mut self, baseline: BTreeMap<String, String>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Set progress channel for updates.
    pub fn with_progress(mut self, tx: mpsc::Sender<VerifyProgressUpdate>) -> Self {
        self.progress_tx = Some(tx);
        self
    }

    async fn send_progress(&self, update: VerifyProgressUpdate) {
        if let Some(tx) = &self.progress_tx {
            let _ = tx.send(update).await;
        }
    }

    /// Verify every table in `expected`, returning results in the map's order.
    pub async fn verify(&self, expected: &BTreeMap<String, i64>) -> Vec<VerificationResult> {
        let started = Instant::now();
        let total = expected.len();
        info!("Verifying {} tables", total);

        let mut pending = stream::iter(expected.iter())
            .map(|(table, count)| self.verify_table(table, *count))
            .buffered(self.concurrency);

        let mut results = Vec::with_capacity(total);
        let mut mismatches = 0;
        while let Some(result) = pending.next().await {
            if !result.matches {
                mismatches += 1;
            }
            let table = result.table.clone();
            results.push(result);
            self.send_progress(VerifyProgressUpdate {
                table,
                tables_total: total,
                tables_completed: results.len(),
                mismatches_found: mismatches,
            })
            .await;
        }

        info!(
            "Verification finished: {}/{} tables match in {:?}",
            total - mismatches,
            total,
            started.elapsed()
        );
        results
    }

    /// Verify a single table.
    pub async fn verify_table(&self, table_name: &str, expected: i64) -> VerificationResult {
        let start = Instant::now();
        let mut result = VerificationResult::pending(table_name, expected);

        let Some(table) = TableRef::parse(table_name) else {
            result.error = Some(format!("invalid table name: {}", table_name));
            return result;
        };

        match self.count_and_checksum(&table).await {
            Ok((count, checksum)) => {
                result.actual = count;
                result.checksum = Some(checksum);
            }
            Err(e) => {
                warn!("Row count failed for {}: {}", table, e);
                result.error = Some(e.to_string());
                result.duration_ms = start.elapsed().as_millis() as u64;
                return result;
            }
        }

        if result.actual > 0 {
            match self.orphan_check(&table).await {
                Ok(orphans) => result.orphan_check = orphans,
                Err(e) => warn!("Orphan check failed for {}: {}", table, e),
            }
        }

        let checksum_consistent = match self.baseline.get(&table.qualified()) {
            Some(baseline) => result.checksum.as_deref() == Some(baseline.as_str()),
            None => true,
        };
        result.matches = result.actual == expected && checksum_consistent;
        result.duration_ms = start.elapsed().as_millis() as u64;

        if result.matches {
            debug!("{}: {} rows, checksum {:?}", table, result.actual, result.checksum);
        } else {
            warn!(
                "{}: expected {} rows, found {} (checksum consistent: {})",
                table, expected, result.actual, checksum_consistent
            );
        }
        result
    }

    async fn count_and_checksum(&self, table: &TableRef) -> Result<(i64, String)> {
        let sql = count_checksum_query(table)?;
        let result = self.channel.query(&self.connection, &sql).await?;
        let row = result
            .first()
            .ok_or_else(|| DumpImportError::Channel(format!("no count returned for {}", table)))?;
        let count = row
            .get_i64("row_count")
            .ok_or_else(|| DumpImportError::Channel(format!("no count returned for {}", table)))?;
        Ok((count, row.get("checksum").unwrap_or_default().to_string()))
    }

    /// Foreign keys declared on `table`.
    pub async fn foreign_keys(&self, table: &TableRef) -> Result<Vec<ForeignKey>> {
        let sql = foreign_keys_query(table)?;
        let result = self.channel.query(&self.connection, &sql).await?;

        let mut keys = Vec::with_capacity(result.rows.len());
        for row in &result.rows {
            let columns = |name: &str| -> Result<Vec<String>> {
                Ok(serde_json::from_str(row.get(name).unwrap_or("[]"))?)
            };
            keys.push(ForeignKey {
                name: row.get("constraint_name").unwrap_or_default().to_string(),
                child: TableRef::new(
                    row.get("child_schema").unwrap_or(table.schema.as_str()),
                    row.get("child_table").unwrap_or(table.name.as_str()),
                ),
                child_columns: columns("child_columns")?,
                parent: TableRef::new(
                    row.get("parent_schema").unwrap_or_default(),
                    row.get("parent_table").unwrap_or_default(),
                ),
                parent_columns: columns("parent_columns")?,
            });
        }
        Ok(keys)
    }

    async fn orphan_check(&self, table: &TableRef) -> Result<Option<OrphanCheck>> {
        let mut total = 0;
        let mut offending = Vec::new();
        for fk in self.foreign_keys(table).await? {
            if fk.child_columns.is_empty() || fk.child_columns.len() != fk.parent_columns.len() {
                continue;
            }
            let sql = orphan_count_query(&fk)?;
            let orphans = self
                .channel
                .query(&self.connection, &sql)
                .await?
                .first()
                .and_then(|r| r.get_i64("orphans"))
                .unwrap_or(0);
            if orphans > 0 {
                total += orphans;
                offending.push(fk.name);
            }
        }

        Ok((total > 0).then(|| OrphanCheck {
            has_orphans: true,
            orphan_count: total,
            constraint_name: offending.join(", "),
        }))
    }
}

/// Expected row counts per table as estimated from a parsed dump.
pub fn expected_counts(parsed: &ParsedSqlFile) -> BTreeMap<String, i64> {
    parsed
        .metadata
        .row_counts_by_table
        .iter()
        .map(|(table, rows)| (table.clone(), i64::try_from(*rows).unwrap_or(i64::MAX)))
        .collect()
}
