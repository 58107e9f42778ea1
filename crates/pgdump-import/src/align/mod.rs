//! Two-stage schema alignment between a dump and a drifted target.
//!
//! Before any dump statement runs, the stager compares the dump's implied
//! table shapes with the live target and makes additive changes:
//!
//! - target columns the dump never supplies lose NOT NULL so inserts succeed
//! - Stage 1 adds columns the dump carries but the target lacks, backfilling
//!   them from their default
//! - Stage 2 promotes added columns to NOT NULL once no NULLs remain
//!
//! Every applied statement is kept in an ordered audit with its inverse, so
//! [`SchemaAligner::rollback`] can undo the whole alignment.

mod rollback;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::channel::{ExecuteOptions, ExecutionChannel};
use crate::config::{AlignmentConfig, ConnectionConfig};
use crate::core::identifier::{quote_literal, quote_pg, TableRef};
use crate::error::{DumpImportError, Result};
use crate::parser::TableDefinition;
use crate::session::{Journal, LogLevel};

pub use rollback::RollbackOutcome;

static ARRAY_DEFAULT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)\bARRAY\b").unwrap());

/// Which step of the alignment produced a change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignmentStage {
    Relax,
    StageOne,
    StageTwo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AlignmentAction {
    DropNotNull,
    AddColumn,
    Backfill,
    SetNotNull,
}

/// One applied alignment statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlignmentChange {
    pub stage: AlignmentStage,
    pub action: AlignmentAction,
    pub table: TableRef,
    pub column: String,
    pub statement: String,
    /// Statement that undoes this one. Backfills have none; dropping the
    /// column reverts them.
    pub rollback: Option<String>,
    /// Operator-facing description, e.g. `ADD COLUMN with DEFAULT: public.t.c`.
    pub summary: String,
    pub applied_at: DateTime<Utc>,
}

/// A live target column as information_schema reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
}

/// Column added in Stage 1, waiting for the Stage 2 decision.
#[derive(Debug, Clone)]
struct AddedColumn {
    table: TableRef,
    column: String,
    has_default: bool,
    dump_not_null: bool,
}

/// Plans, applies and audits alignment changes on one target.
pub struct SchemaAligner {
    channel: Arc<dyn ExecutionChannel>,
    connection: ConnectionConfig,
    config: AlignmentConfig,
    audit: Vec<AlignmentChange>,
    added: Vec<AddedColumn>,
}

impl fmt::Debug for SchemaAligner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchemaAligner")
            .field("connection", &self.connection)
            .field("config", &self.config)
            .field("audit", &self.audit.len())
            .finish()
    }
}

impl SchemaAligner {
    pub fn new(
        channel: Arc<dyn ExecutionChannel>,
        connection: ConnectionConfig,
        config: AlignmentConfig,
    ) -> Self {
        Self {
            channel,
            connection,
            config,
            audit: Vec::new(),
            added: Vec::new(),
        }
    }

    /// Applied changes in the order they ran.
    pub fn audit(&self) -> &[AlignmentChange] {
        &self.audit
    }

    /// Relax NOT NULL on target-only columns and add dump-only columns.
    ///
    /// Returns the number of statements applied.
    pub async fn stage_one(
        &mut self,
        dump: &[TableDefinition],
        journal: &mut Journal,
    ) -> Result<usize> {
        let target = self.introspect().await?;
        let required: BTreeSet<&str> = self
            .config
            .required_not_null_columns
            .iter()
            .map(String::as_str)
            .collect();

        let mut relax = Vec::new();
        let mut stage_one = Vec::new();
        let mut added = Vec::new();

        for def in dump {
            if def.columns.is_empty() || !self.in_scope(&def.table) {
                continue;
            }
            let Some(columns) = target.get(&def.table.qualified()) else {
                continue;
            };
            let table = def.table.quoted()?;

            if self.config.relax_missing_not_null {
                for col in columns {
                    let fq = format!("{}.{}", def.table, col.name);
                    if def.column(&col.name).is_some()
                        || col.nullable
                        || col.default.is_some()
                        || required.contains(fq.as_str())
                    {
                        continue;
                    }
                    let column = quote_pg(&col.name)?;
                    relax.push(change(
                        AlignmentStage::Relax,
                        AlignmentAction::DropNotNull,
                        &def.table,
                        &col.name,
                        format!("ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL;", table, column),
                        Some(format!(
                            "ALTER TABLE {} ALTER COLUMN {} SET NOT NULL;",
                            table, column
                        )),
                        format!("Drop NOT NULL for extra column: {}", fq),
                    ));
                }
            }

            for col in &def.columns {
                if columns.iter().any(|c| c.name == col.name) {
                    continue;
                }
                let fq = format!("{}.{}", def.table, col.name);
                let column = quote_pg(&col.name)?;
                let add = format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    table,
                    column,
                    safe_type(&col.data_type)
                );
                let drop = Some(format!(
                    "ALTER TABLE {} DROP COLUMN IF EXISTS {};",
                    table, column
                ));
                let default = col
                    .default
                    .as_deref()
                    .filter(|d| !ARRAY_DEFAULT.is_match(d) && !d.contains(';'));

                match default {
                    Some(default) => {
                        stage_one.push(change(
                            AlignmentStage::StageOne,
                            AlignmentAction::AddColumn,
                            &def.table,
                            &col.name,
                            format!("{} DEFAULT {};", add, default),
                            drop,
                            format!("ADD COLUMN with DEFAULT: {}", fq),
                        ));
                        if self.config.heuristics.backfill_with_default {
                            stage_one.push(change(
                                AlignmentStage::StageOne,
                                AlignmentAction::Backfill,
                                &def.table,
                                &col.name,
                                format!(
                                    "UPDATE {} SET {} = {} WHERE {} IS NULL;",
                                    table, column, default, column
                                ),
                                None,
                                format!("Backfill with DEFAULT: {}", fq),
                            ));
                        }
                    }
                    None => {
                        let summary = if col.default.is_some() {
                            format!("ADD COLUMN (array, default skipped): {}", fq)
                        } else {
                            format!("ADD COLUMN (nullable): {}", fq)
                        };
                        stage_one.push(change(
                            AlignmentStage::StageOne,
                            AlignmentAction::AddColumn,
                            &def.table,
                            &col.name,
                            format!("{};", add),
                            drop,
                            summary,
                        ));
                    }
                }
                added.push(AddedColumn {
                    table: def.table.clone(),
                    column: col.name.clone(),
                    has_default: default.is_some(),
                    dump_not_null: col.not_null,
                });
            }
        }

        let mut applied = 0;
        if !relax.is_empty() {
            journal.log(
                LogLevel::Info,
                "Relaxing NOT NULL on extra columns",
                Some(summaries(&relax)),
            );
            applied += relax.len();
            self.apply(
                relax,
                journal,
                "Failed to relax NOT NULL constraints for extra columns",
            )
            .await?;
        }

        if stage_one.is_empty() {
            journal.log(
                LogLevel::Info,
                "Schema validation completed",
                Some("No missing columns detected".to_string()),
            );
            return Ok(applied);
        }

        let tables: BTreeSet<String> = added.iter().map(|a| a.table.qualified()).collect();
        journal.log(
            LogLevel::Info,
            "Schema differences detected",
            Some(format!(
                "Adding {} missing columns across {} tables",
                added.len(),
                tables.len()
            )),
        );
        journal.log(
            LogLevel::Info,
            "Applying Stage 1 schema changes",
            Some(summaries(&stage_one)),
        );
        applied += stage_one.len();
        self.apply(stage_one, journal, "Failed to apply Stage 1 schema changes")
            .await?;
        self.added = added;
        Ok(applied)
    }

    /// Promote columns added in Stage 1 to NOT NULL where the heuristics
    /// allow and no NULLs remain.
    pub async fn stage_two(&mut self, journal: &mut Journal) -> Result<usize> {
        let added = std::mem::take(&mut self.added);
        let heuristics = self.config.heuristics.clone();
        let mut changes = Vec::new();

        for col in added {
            let fq = format!("{}.{}", col.table, col.column);
            let required = self.config.required_not_null_columns.contains(&fq);
            let consider = required
                || (heuristics.allow_not_null_when_default && col.has_default)
                || (heuristics.allow_not_null_when_no_nulls && col.dump_not_null);
            if !consider {
                continue;
            }

            let nulls = match self.null_count(&col.table, &col.column).await {
                Ok(n) => n,
                Err(e) => {
                    journal.log(
                        LogLevel::Warn,
                        format!("Heuristic check failed for {}", fq),
                        Some(e.to_string()),
                    );
                    continue;
                }
            };

            if nulls == 0 {
                let table = col.table.quoted()?;
                let column = quote_pg(&col.column)?;
                changes.push(change(
                    AlignmentStage::StageTwo,
                    AlignmentAction::SetNotNull,
                    &col.table,
                    &col.column,
                    format!("ALTER TABLE {} ALTER COLUMN {} SET NOT NULL;", table, column),
                    Some(format!(
                        "ALTER TABLE {} ALTER COLUMN {} DROP NOT NULL;",
                        table, column
                    )),
                    format!("SET NOT NULL: {} (nulls={})", fq, nulls),
                ));
            } else if required {
                journal.warn(format!(
                    "Required NOT NULL skipped due to {} NULLs in {}",
                    nulls, fq
                ));
            } else {
                journal.info(format!("NOT NULL not applied: {} (nulls={})", fq, nulls));
            }
        }

        if changes.is_empty() {
            return Ok(0);
        }
        journal.log(
            LogLevel::Info,
            "Applying Stage 2 constraints",
            Some(summaries(&changes)),
        );
        let applied = changes.len();
        self.apply(changes, journal, "Failed to apply Stage 2 constraints")
            .await?;
        Ok(applied)
    }

    fn in_scope(&self, table: &TableRef) -> bool {
        self.config.allowed_schemas.iter().any(|s| *s == table.schema)
            && !self
                .config
                .excluded_tables
                .iter()
                .any(|t| *t == table.qualified())
    }

    /// Columns of every table in the allowed schemas, keyed by `schema.table`.
    pub async fn introspect(&self) -> Result<BTreeMap<String, Vec<TargetColumn>>> {
        let schemas = self
            .config
            .allowed_schemas
            .iter()
            .map(|s| quote_literal(s))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT table_schema, table_name, column_name, data_type, is_nullable, column_default \
             FROM information_schema.columns \
             WHERE table_schema IN ({}) \
             ORDER BY table_schema, table_name, ordinal_position",
            schemas
        );
        let result = self
            .channel
            .query(&self.connection, &sql)
            .await
            .map_err(|e| DumpImportError::Alignment(format!("introspection failed: {}", e)))?;

        let mut tables: BTreeMap<String, Vec<TargetColumn>> = BTreeMap::new();
        for row in &result.rows {
            let (Some(schema), Some(table), Some(column)) = (
                row.get("table_schema"),
                row.get("table_name"),
                row.get("column_name"),
            ) else {
                continue;
            };
            tables
                .entry(format!("{}.{}", schema, table))
                .or_default()
                .push(TargetColumn {
                    name: column.to_string(),
                    data_type: row.get("data_type").unwrap_or("text").to_string(),
                    nullable: row.get("is_nullable").map_or(true, |v| v == "YES"),
                    default: row.get("column_default").map(str::to_string),
                });
        }
        Ok(tables)
    }

    async fn null_count(&self, table: &TableRef, column: &str) -> Result<i64> {
        let sql = format!(
            "SELECT count(*) AS nulls FROM {} WHERE {} IS NULL",
            table.quoted()?,
            quote_pg(column)?
        );
        let result = self.channel.query(&self.connection, &sql).await?;
        result
            .first()
            .and_then(|r| r.get_i64("nulls"))
            .ok_or_else(|| DumpImportError::Alignment(format!("no NULL count returned for {}", sql)))
    }

    /// Run `changes` in one transaction and append them to the audit.
    async fn apply(
        &mut self,
        changes: Vec<AlignmentChange>,
        journal: &mut Journal,
        failure: &str,
    ) -> Result<()> {
        let statements: Vec<String> = changes.iter().map(|c| c.statement.clone()).collect();
        let options = ExecuteOptions {
            transactional: true,
            stop_on_error: true,
            ..ExecuteOptions::default()
        };
        let message = match self
            .channel
            .execute(&self.connection, &statements, &options)
            .await
        {
            Ok(result) if result.success => {
                self.audit.extend(changes);
                return Ok(());
            }
            Ok(result) => result.error.unwrap_or_else(|| failure.to_string()),
            Err(e) => e.to_string(),
        };
        journal.log(LogLevel::Error, failure, Some(message.clone()));
        Err(DumpImportError::Alignment(format!("{}: {}", failure, message)))
    }
}

fn change(
    stage: AlignmentStage,
    action: AlignmentAction,
    table: &TableRef,
    column: &str,
    statement: String,
    rollback: Option<String>,
    summary: String,
) -> AlignmentChange {
    AlignmentChange {
        stage,
        action,
        table: table.clone(),
        column: column.to_string(),
        statement,
        rollback,
        summary,
        applied_at: Utc::now(),
    }
}

fn summaries(changes: &[AlignmentChange]) -> String {
    changes
        .iter()
        .map(|c| c.summary.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}

/// Column type usable in ADD COLUMN. information_schema pseudo-types fall
/// back to text.
fn safe_type(data_type: &str) -> String {
    let trimmed = data_type.trim();
    if trimmed.eq_ignore_ascii_case("ARRAY") {
        "text[]".to_string()
    } else if trimmed.is_empty()
        || trimmed.eq_ignore_ascii_case("USER-DEFINED")
        || trimmed.contains(';')
    {
        "text".to_string()
    } else {
        trimmed.to_string()
    }
}
