//! Scripted execution channel used by unit tests.
//!
//! Records every call, fails statements containing configured needles and
//! keeps a small column catalog that `ALTER TABLE` statements mutate, so
//! alignment and rollback can be observed end to end.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;

use crate::align::TargetColumn;
use crate::channel::{
    preview, ConnectionInfo, ConnectionTestResult, ExecuteOptions, ExecuteResult,
    ExecutionChannel, QueryResult, QueryRow, StatementOutcome, StatementStatus,
};
use crate::config::ConnectionConfig;
use crate::core::identifier::TableRef;
use crate::error::{DumpImportError, Result};

static QUOTED_TABLE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#""((?:[^"]|"")+)"\."((?:[^"]|"")+)""#).unwrap());

static ALTER_TABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^ALTER\s+TABLE\s+(?:ONLY\s+)?"((?:[^"]|"")+)"\."((?:[^"]|"")+)"\s+(.*?);?\s*$"#)
        .unwrap()
});

static ADD_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^ADD\s+COLUMN\s+"((?:[^"]|"")+)"\s+(.+?)(?:\s+DEFAULT\s+(.+))?$"#).unwrap()
});

static DROP_COLUMN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^DROP\s+COLUMN\s+(?:IF\s+EXISTS\s+)?"((?:[^"]|"")+)"$"#).unwrap()
});

static ALTER_NULLABILITY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)^ALTER\s+COLUMN\s+"((?:[^"]|"")+)"\s+(DROP|SET)\s+NOT\s+NULL$"#).unwrap()
});

static NULL_COUNT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"WHERE\s+"((?:[^"]|"")+)"\s+IS\s+NULL"#).unwrap());

/// One `execute` call.
#[derive(Debug, Clone)]
pub(crate) struct Call {
    pub statements: Vec<String>,
    pub options: ExecuteOptions,
}

struct Failure {
    needle: String,
    message: String,
    sqlstate: Option<String>,
    /// `None` fails forever.
    remaining: Option<usize>,
}

#[derive(Debug, Clone)]
struct FakeForeignKey {
    name: String,
    child: TableRef,
    child_column: String,
    parent: TableRef,
    parent_column: String,
    orphans: i64,
}

type Hook = Box<dyn Fn(&[String]) + Send + Sync>;

#[derive(Default)]
struct FakeState {
    calls: Vec<Call>,
    statement_failures: Vec<Failure>,
    query_failures: Vec<(String, String)>,
    tables: BTreeSet<String>,
    catalog: BTreeMap<String, Vec<TargetColumn>>,
    null_counts: HashMap<String, i64>,
    row_counts: HashMap<String, (i64, String)>,
    foreign_keys: Vec<FakeForeignKey>,
    queries: Vec<String>,
}

#[derive(Default)]
pub(crate) struct FakeChannel {
    state: Mutex<FakeState>,
    on_execute: Mutex<Option<Hook>>,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

impl FakeChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Fail every statement containing `needle`.
    pub fn fail_on(&self, needle: &str, message: &str) {
        self.push_failure(needle, message, None, None);
    }

    /// Fail statements containing `needle` for the next `times` attempts.
    pub fn fail_times(&self, needle: &str, message: &str, sqlstate: Option<&str>, times: usize) {
        self.push_failure(needle, message, sqlstate, Some(times));
    }

    fn push_failure(&self, needle: &str, message: &str, sqlstate: Option<&str>, remaining: Option<usize>) {
        self.lock().statement_failures.push(Failure {
            needle: needle.to_string(),
            message: message.to_string(),
            sqlstate: sqlstate.map(str::to_string),
            remaining,
        });
    }

    /// Fail every read-only query containing `needle`.
    pub fn fail_query(&self, needle: &str, message: &str) {
        self.lock()
            .query_failures
            .push((needle.to_string(), message.to_string()));
    }

    /// Run `hook` with the statements of every non-dry-run batch before it
    /// executes.
    pub fn on_execute(&self, hook: impl Fn(&[String]) + Send + Sync + 'static) {
        *self.on_execute.lock().unwrap_or_else(|e| e.into_inner()) = Some(Box::new(hook));
    }

    pub fn add_table(&self, schema: &str, table: &str) {
        self.lock().tables.insert(format!("{}.{}", schema, table));
    }

    pub fn add_column(
        &self,
        schema: &str,
        table: &str,
        column: &str,
        data_type: &str,
        nullable: bool,
        default: Option<&str>,
    ) {
        let mut state = self.lock();
        let key = format!("{}.{}", schema, table);
        state.tables.insert(key.clone());
        state.catalog.entry(key).or_default().push(TargetColumn {
            name: column.to_string(),
            data_type: data_type.to_string(),
            nullable,
            default: default.map(str::to_string),
        });
    }

    pub fn column(&self, schema: &str, table: &str, column: &str) -> Option<TargetColumn> {
        self.lock()
            .catalog
            .get(&format!("{}.{}", schema, table))
            .and_then(|cols| cols.iter().find(|c| c.name == column).cloned())
    }

    /// Remove a column behind the importer's back.
    pub fn drop_column(&self, schema: &str, table: &str, column: &str) {
        if let Some(cols) = self.lock().catalog.get_mut(&format!("{}.{}", schema, table)) {
            cols.retain(|c| c.name != column);
        }
    }

    pub fn set_null_count(&self, schema: &str, table: &str, column: &str, nulls: i64) {
        self.lock()
            .null_counts
            .insert(format!("{}.{}.{}", schema, table, column), nulls);
    }

    pub fn set_row_count(&self, schema: &str, table: &str, rows: i64, checksum: &str) {
        self.lock()
            .row_counts
            .insert(format!("{}.{}", schema, table), (rows, checksum.to_string()));
    }

    pub fn add_foreign_key(
        &self,
        name: &str,
        child: &str,
        child_column: &str,
        parent: &str,
        parent_column: &str,
        orphans: i64,
    ) {
        let (Some(child), Some(parent)) = (TableRef::parse(child), TableRef::parse(parent)) else {
            return;
        };
        self.lock().foreign_keys.push(FakeForeignKey {
            name: name.to_string(),
            child,
            child_column: child_column.to_string(),
            parent,
            parent_column: parent_column.to_string(),
            orphans,
        });
    }

    pub fn calls(&self) -> Vec<Call> {
        self.lock().calls.clone()
    }

    /// Statement lists of every batch that was really executed.
    pub fn executed(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| !c.options.dry_run)
            .map(|c| c.statements)
            .collect()
    }

    pub fn dry_runs(&self) -> Vec<Vec<String>> {
        self.calls()
            .into_iter()
            .filter(|c| c.options.dry_run)
            .map(|c| c.statements)
            .collect()
    }

    /// Every statement dispatched outside dry runs, in order.
    pub fn dispatched(&self) -> Vec<String> {
        self.executed().into_iter().flatten().collect()
    }

    pub fn queries(&self) -> Vec<String> {
        self.lock().queries.clone()
    }

    /// Most read-only queries ever outstanding at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

impl FakeState {
    fn failure_for(&mut self, sql: &str) -> Option<(String, Option<String>)> {
        let failure = self.statement_failures.iter_mut().find(|f| {
            sql.contains(&f.needle) && f.remaining.map_or(true, |n| n > 0)
        })?;
        if let Some(n) = failure.remaining.as_mut() {
            *n -= 1;
        }
        Some((failure.message.clone(), failure.sqlstate.clone()))
    }

    fn apply(&mut self, sql: &str) {
        let Some(caps) = ALTER_TABLE.captures(sql.trim()) else {
            return;
        };
        let key = format!("{}.{}", unquote(&caps[1]), unquote(&caps[2]));
        let action = caps[3].trim();
        let columns = self.catalog.entry(key).or_default();

        if let Some(add) = ADD_COLUMN.captures(action) {
            columns.push(TargetColumn {
                name: unquote(&add[1]),
                data_type: add[2].trim().to_string(),
                nullable: true,
                default: add.get(3).map(|d| d.as_str().trim().to_string()),
            });
        } else if let Some(drop) = DROP_COLUMN.captures(action) {
            let name = unquote(&drop[1]);
            columns.retain(|c| c.name != name);
        } else if let Some(alter) = ALTER_NULLABILITY.captures(action) {
            let name = unquote(&alter[1]);
            if let Some(col) = columns.iter_mut().find(|c| c.name == name) {
                col.nullable = alter[2].eq_ignore_ascii_case("DROP");
            }
        }
    }

    fn answer(&self, sql: &str) -> Result<QueryResult> {
        let tables = tables_in(sql);
        let rows = if sql.contains("pg_constraint") {
            let Some(table) = tables.first() else {
                return Ok(QueryResult::default());
            };
            self.foreign_keys
                .iter()
                .filter(|fk| fk.child == *table)
                .map(|fk| {
                    row(&[
                        ("constraint_name", Some(fk.name.clone())),
                        ("child_schema", Some(fk.child.schema.clone())),
                        ("child_table", Some(fk.child.name.clone())),
                        ("parent_schema", Some(fk.parent.schema.clone())),
                        ("parent_table", Some(fk.parent.name.clone())),
                        ("child_columns", Some(format!("[\"{}\"]", fk.child_column))),
                        ("parent_columns", Some(format!("[\"{}\"]", fk.parent_column))),
                    ])
                })
                .collect()
        } else if sql.contains("AS present") {
            let present = tables
                .first()
                .map_or(false, |t| self.tables.contains(&t.qualified()));
            vec![row(&[("present", Some(present.to_string()))])]
        } else if sql.contains("AS orphans") {
            let orphans = match (tables.first(), tables.get(1)) {
                (Some(child), Some(parent)) => self
                    .foreign_keys
                    .iter()
                    .find(|fk| fk.child == *child && fk.parent == *parent)
                    .map_or(0, |fk| fk.orphans),
                _ => 0,
            };
            vec![row(&[("orphans", Some(orphans.to_string()))])]
        } else if sql.contains("information_schema.columns") {
            self.catalog
                .iter()
                .flat_map(|(key, cols)| {
                    let (schema, table) = key.split_once('.').unwrap_or(("public", key.as_str()));
                    cols.iter().map(move |c| {
                        row(&[
                            ("table_schema", Some(schema.to_string())),
                            ("table_name", Some(table.to_string())),
                            ("column_name", Some(c.name.clone())),
                            ("data_type", Some(c.data_type.clone())),
                            ("is_nullable", Some(if c.nullable { "YES" } else { "NO" }.to_string())),
                            ("column_default", c.default.clone()),
                        ])
                    })
                })
                .collect()
        } else if sql.contains("AS nulls") {
            let column = NULL_COUNT
                .captures(sql)
                .map(|c| unquote(&c[1]))
                .unwrap_or_default();
            let nulls = tables
                .first()
                .and_then(|t| self.null_counts.get(&format!("{}.{}", t.qualified(), column)))
                .copied()
                .unwrap_or(0);
            vec![row(&[("nulls", Some(nulls.to_string()))])]
        } else if sql.contains("AS row_count") {
            let Some(table) = tables.first() else {
                return Ok(QueryResult::default());
            };
            let Some((count, checksum)) = self.row_counts.get(&table.qualified()) else {
                return Err(DumpImportError::Channel(format!(
                    "relation \"{}\" does not exist",
                    table
                )));
            };
            vec![row(&[
                ("row_count", Some(count.to_string())),
                ("checksum", Some(checksum.clone())),
            ])]
        } else {
            Vec::new()
        };
        Ok(QueryResult { rows })
    }
}

#[async_trait]
impl ExecutionChannel for FakeChannel {
    async fn execute(
        &self,
        _connection: &ConnectionConfig,
        statements: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        if !options.dry_run {
            if let Some(hook) = self.on_execute.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                hook(statements);
            }
        }

        let mut state = self.lock();
        state.calls.push(Call {
            statements: statements.to_vec(),
            options: *options,
        });

        let wrapped = options.transactional || options.dry_run;
        let snapshot = wrapped.then(|| state.catalog.clone());
        let mut results = Vec::with_capacity(statements.len());
        let mut first_error: Option<String> = None;

        for (index, sql) in statements.iter().enumerate() {
            if first_error.is_some() && options.stop_on_error {
                results.push(StatementOutcome {
                    index,
                    status: StatementStatus::Skipped,
                });
                continue;
            }
            match state.failure_for(sql) {
                Some((error, sqlstate)) => {
                    results.push(StatementOutcome {
                        index,
                        status: StatementStatus::Failed {
                            statement: preview(sql),
                            error: error.clone(),
                            sqlstate,
                        },
                    });
                    first_error.get_or_insert(error);
                }
                None => {
                    state.apply(sql);
                    results.push(StatementOutcome {
                        index,
                        status: StatementStatus::Executed,
                    });
                }
            }
        }

        let abort = options.dry_run || (wrapped && first_error.is_some() && options.stop_on_error);
        if abort {
            if let Some(snapshot) = snapshot {
                state.catalog = snapshot;
            }
            if !options.dry_run {
                for outcome in results.iter_mut() {
                    if outcome.status == StatementStatus::Executed {
                        outcome.status = StatementStatus::RolledBack;
                    }
                }
            }
        }

        Ok(ExecuteResult {
            success: first_error.is_none(),
            results,
            error: first_error,
        })
    }

    async fn query(&self, _connection: &ConnectionConfig, sql: &str) -> Result<QueryResult> {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        // Give other callers the chance to overlap with this one.
        tokio::task::yield_now().await;

        let result = {
            let mut state = self.lock();
            state.queries.push(sql.to_string());
            match state.query_failures.iter().find(|(n, _)| sql.contains(n)) {
                Some((_, message)) => Err(DumpImportError::Channel(message.clone())),
                None => state.answer(sql),
            }
        };
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn test_connection(&self, connection: &ConnectionConfig) -> ConnectionTestResult {
        ConnectionTestResult {
            success: true,
            message: format!("Connected to {} as {}", connection.database, connection.user),
            connection_info: Some(ConnectionInfo {
                version: "PostgreSQL 16.2".to_string(),
                database: connection.database.clone(),
                user: connection.user.clone(),
            }),
        }
    }
}

fn row(values: &[(&str, Option<String>)]) -> QueryRow {
    values.iter().map(|(k, v)| (*k, v.clone())).collect()
}

fn unquote(raw: &str) -> String {
    raw.replace("\"\"", "\"")
}

/// Quoted `"schema"."table"` pairs in order of appearance.
fn tables_in(sql: &str) -> Vec<TableRef> {
    QUOTED_TABLE
        .captures_iter(sql)
        .map(|c| TableRef::new(unquote(&c[1]), unquote(&c[2])))
        .collect()
}
