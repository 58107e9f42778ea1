//! PostgreSQL execution channel backed by deadpool-postgres.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use futures::SinkExt;
use tokio::sync::Mutex;
use tokio_postgres::{Client, Config as PgConfig, NoTls, SimpleQueryMessage};
use tracing::{debug, info, warn};

use super::conflict::{self, ConflictKeys};
use super::tls::{SslMode, TlsBuilder};
use super::{
    preview, split_copy, ConnectionInfo, ConnectionTestResult, ExecuteOptions, ExecuteResult,
    ExecutionChannel, QueryResult, QueryRow, StatementOutcome, StatementStatus,
};
use crate::config::{ConnectionConfig, OnConflict};
use crate::core::identifier::{quote_literal, TableRef};
use crate::error::{DumpImportError, Result};

const SAVEPOINT: &str = "pgdump_import_stmt";

/// Channel that executes statements on a real PostgreSQL server.
///
/// One pool is kept per distinct connection so repeated batches reuse
/// sessions.
pub struct PgChannel {
    pools: Mutex<HashMap<String, Pool>>,
    conflict_keys: Mutex<HashMap<String, ConflictKeys>>,
    max_connections: usize,
}

impl Default for PgChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PgChannel {
    pub fn new() -> Self {
        Self::with_max_connections(4)
    }

    pub fn with_max_connections(max_connections: usize) -> Self {
        Self {
            pools: Mutex::new(HashMap::new()),
            conflict_keys: Mutex::new(HashMap::new()),
            max_connections: max_connections.max(1),
        }
    }

    /// Check out a session. The pool map is only locked to look up or
    /// register a pool, never across a checkout.
    async fn client(&self, connection: &ConnectionConfig) -> Result<Object> {
        let key = connection.pool_key();
        let existing = self.pools.lock().await.get(&key).cloned();

        if let Some(pool) = existing {
            let client = pool
                .get()
                .await
                .map_err(|e| DumpImportError::pool(e.to_string(), format!("checkout for {}", key)))?;
            apply_session_settings(&client, connection).await?;
            return Ok(client);
        }

        let pool = self.build_pool(connection, connection.ssl)?;
        let (pool, client) = match pool.get().await {
            Ok(client) => (pool, client),
            Err(e) if connection.ssl == SslMode::Prefer => {
                warn!("TLS connection failed ({}), retrying without TLS", e);
                let plain = self.build_pool(connection, SslMode::Disable)?;
                let client = plain.get().await.map_err(|e| {
                    DumpImportError::pool(e.to_string(), format!("connecting to {}", key))
                })?;
                (plain, client)
            }
            Err(e) => {
                return Err(DumpImportError::pool(
                    e.to_string(),
                    format!("connecting to {}", key),
                ))
            }
        };

        info!(
            "Connected to PostgreSQL: {}:{}/{}",
            connection.host, connection.port, connection.database
        );
        apply_session_settings(&client, connection).await?;
        self.pools.lock().await.entry(key).or_insert(pool);
        Ok(client)
    }

    fn build_pool(&self, connection: &ConnectionConfig, ssl: SslMode) -> Result<Pool> {
        let mut pg_config = PgConfig::new();
        pg_config.host(&connection.host);
        pg_config.port(connection.port);
        pg_config.dbname(&connection.database);
        pg_config.user(&connection.user);
        pg_config.password(&connection.password);
        pg_config.application_name("pgdump-import");
        pg_config.connect_timeout(Duration::from_secs(connection.connect_timeout_secs));

        let mgr_config = ManagerConfig {
            recycling_method: RecyclingMethod::Fast,
        };

        let mgr = match TlsBuilder::new(ssl).build()? {
            Some(tls) => Manager::from_config(pg_config, tls, mgr_config),
            None => Manager::from_config(pg_config, NoTls, mgr_config),
        };

        Pool::builder(mgr)
            .max_size(self.max_connections)
            .build()
            .map_err(|e| DumpImportError::pool(e.to_string(), "building connection pool"))
    }

    /// Primary key and column names of `table`, cached per connection.
    async fn conflict_keys(
        &self,
        client: &Client,
        connection: &ConnectionConfig,
        table: &TableRef,
    ) -> Option<ConflictKeys> {
        let cache_key = format!("{}#{}", connection.pool_key(), table.qualified());
        if let Some(keys) = self.conflict_keys.lock().await.get(&cache_key) {
            return Some(keys.clone());
        }

        let regclass = quote_literal(&table.quoted().ok()?);
        let pk_sql = format!(
            "SELECT a.attname FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = to_regclass({}) AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            regclass
        );
        let col_sql = format!(
            "SELECT attname FROM pg_attribute \
             WHERE attrelid = to_regclass({}) AND attnum > 0 AND NOT attisdropped \
             ORDER BY attnum",
            regclass
        );

        let primary_key = first_column(client.simple_query(&pk_sql).await.ok()?);
        let columns = first_column(client.simple_query(&col_sql).await.ok()?);
        let keys = ConflictKeys {
            primary_key,
            columns,
        };
        self.conflict_keys
            .lock()
            .await
            .insert(cache_key, keys.clone());
        Some(keys)
    }

    async fn prepare(
        &self,
        client: &Client,
        connection: &ConnectionConfig,
        sql: &str,
        policy: OnConflict,
    ) -> String {
        if policy == OnConflict::Error {
            return sql.to_string();
        }
        let keys = match (policy, conflict::insert_target(sql)) {
            (OnConflict::Update, Some(table)) => self.conflict_keys(client, connection, &table).await,
            _ => None,
        };
        conflict::rewrite(sql, policy, keys.as_ref()).into_owned()
    }
}

/// Server message and SQLSTATE of a failed command.
type SqlFailure = (String, Option<String>);

/// The connection a batch runs on.
#[async_trait]
trait BatchSession: Sync {
    /// Transaction or savepoint control command.
    async fn control(&self, sql: &str) -> std::result::Result<(), SqlFailure>;

    async fn statement(&self, sql: &str) -> std::result::Result<(), SqlFailure>;
}

#[async_trait]
impl BatchSession for Client {
    async fn control(&self, sql: &str) -> std::result::Result<(), SqlFailure> {
        self.batch_execute(sql).await.map_err(|e| describe(&e))
    }

    async fn statement(&self, sql: &str) -> std::result::Result<(), SqlFailure> {
        run_statement(self, sql).await.map_err(|e| describe(&e))
    }
}

/// Run `prepared` (the dispatched form of `statements`) on `session`.
///
/// With savepoints each statement is isolated, so one failure does not undo
/// the rest. If a savepoint command itself fails the transaction is no longer
/// usable: later statements are recorded as failed without running and the
/// batch is rolled back.
async fn run_batch<S: BatchSession + ?Sized>(
    session: &S,
    statements: &[String],
    prepared: &[String],
    options: &ExecuteOptions,
) -> ExecuteResult {
    let wrapped = options.transactional || options.dry_run;
    let savepoints = wrapped && (options.dry_run || !options.stop_on_error);

    if wrapped {
        if let Err((error, _)) = session.control("BEGIN").await {
            return ExecuteResult::failed(error);
        }
    }

    let mut results = Vec::with_capacity(statements.len());
    let mut first_error: Option<String> = None;
    let mut aborted: Option<String> = None;

    for (index, (sql, prepared)) in statements.iter().zip(prepared).enumerate() {
        if first_error.is_some() && options.stop_on_error {
            results.push(StatementOutcome {
                index,
                status: StatementStatus::Skipped,
            });
            continue;
        }
        if let Some(reason) = &aborted {
            results.push(failed(index, sql, reason.clone(), None));
            continue;
        }

        if savepoints {
            if let Err((error, sqlstate)) = session.control(&format!("SAVEPOINT {}", SAVEPOINT)).await {
                warn!("SAVEPOINT before statement {} failed: {}", index, error);
                aborted = Some(format!("transaction aborted: savepoint failed: {}", error));
                results.push(failed(index, sql, error.clone(), sqlstate));
                first_error.get_or_insert(error);
                continue;
            }
        }

        match session.statement(prepared).await {
            Ok(()) => {
                if savepoints {
                    if let Err((error, _)) = session
                        .control(&format!("RELEASE SAVEPOINT {}", SAVEPOINT))
                        .await
                    {
                        warn!("RELEASE SAVEPOINT after statement {} failed: {}", index, error);
                        aborted = Some(format!("transaction aborted: release savepoint failed: {}", error));
                        first_error.get_or_insert(error);
                    }
                }
                results.push(StatementOutcome {
                    index,
                    status: StatementStatus::Executed,
                });
            }
            Err((error, sqlstate)) => {
                debug!("Statement {} failed: {}", index, error);
                if savepoints {
                    if let Err((rollback_error, _)) = session
                        .control(&format!("ROLLBACK TO SAVEPOINT {}", SAVEPOINT))
                        .await
                    {
                        warn!(
                            "ROLLBACK TO SAVEPOINT after statement {} failed: {}",
                            index, rollback_error
                        );
                        aborted = Some(format!(
                            "transaction aborted: rollback to savepoint failed: {}",
                            rollback_error
                        ));
                    }
                }
                results.push(failed(index, sql, error.clone(), sqlstate));
                first_error.get_or_insert(error);
            }
        }
    }

    if wrapped {
        let abort = options.dry_run
            || aborted.is_some()
            || (first_error.is_some() && options.stop_on_error);
        if abort {
            if let Err((error, _)) = session.control("ROLLBACK").await {
                warn!("ROLLBACK failed: {}", error);
            }
            if !options.dry_run {
                mark_rolled_back(&mut results);
            }
        } else if let Err((error, _)) = session.control("COMMIT").await {
            mark_rolled_back(&mut results);
            first_error.get_or_insert(error);
        }
    }

    ExecuteResult {
        success: first_error.is_none(),
        results,
        error: first_error,
    }
}

#[async_trait]
impl ExecutionChannel for PgChannel {
    async fn execute(
        &self,
        connection: &ConnectionConfig,
        statements: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        let client = self.client(connection).await?;
        debug!(
            "Executing batch of {} statements (transactional: {}, dry run: {})",
            statements.len(),
            options.transactional,
            options.dry_run
        );
        let pg: &Client = &client;
        let mut prepared = Vec::with_capacity(statements.len());
        for sql in statements {
            prepared.push(self.prepare(pg, connection, sql, options.on_conflict).await);
        }
        Ok(run_batch(pg, statements, &prepared, options).await)
    }

    async fn query(&self, connection: &ConnectionConfig, sql: &str) -> Result<QueryResult> {
        let client = self.client(connection).await?;
        let messages = client.simple_query(sql).await?;
        let rows = messages
            .into_iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(
                    row.columns()
                        .iter()
                        .enumerate()
                        .map(|(i, col)| (col.name().to_string(), row.get(i).map(str::to_string)))
                        .collect::<QueryRow>(),
                ),
                _ => None,
            })
            .collect();
        Ok(QueryResult { rows })
    }

    async fn test_connection(&self, connection: &ConnectionConfig) -> ConnectionTestResult {
        let check = async {
            let result = self
                .query(
                    connection,
                    "SELECT version() AS version, current_database() AS database, current_user AS \"user\"",
                )
                .await?;
            let row = result
                .first()
                .ok_or_else(|| DumpImportError::Connection("connection test returned no rows".into()))?;
            Ok::<_, DumpImportError>(ConnectionInfo {
                version: row.get("version").unwrap_or_default().to_string(),
                database: row.get("database").unwrap_or_default().to_string(),
                user: row.get("user").unwrap_or_default().to_string(),
            })
        };

        match check.await {
            Ok(info) => ConnectionTestResult {
                success: true,
                message: format!("Connected to {} as {}", info.database, info.user),
                connection_info: Some(info),
            },
            Err(e) => ConnectionTestResult {
                success: false,
                message: e.to_string(),
                connection_info: None,
            },
        }
    }
}

async fn apply_session_settings(client: &Client, connection: &ConnectionConfig) -> Result<()> {
    let timeout = connection.statement_timeout_ms.unwrap_or(0);
    client
        .batch_execute(&format!("SET statement_timeout = {}", timeout))
        .await?;
    Ok(())
}

/// Run one statement, streaming inline COPY data through the COPY protocol.
async fn run_statement(client: &Client, sql: &str) -> std::result::Result<(), tokio_postgres::Error> {
    let Some((header, data)) = split_copy(sql) else {
        return client.batch_execute(sql).await;
    };

    let sink = client.copy_in::<_, Bytes>(header).await?;
    futures::pin_mut!(sink);
    if !data.is_empty() {
        sink.send(Bytes::copy_from_slice(data.as_bytes())).await?;
    }
    sink.finish().await?;
    Ok(())
}

/// Server message (with detail, when present) and SQLSTATE of an error.
fn describe(e: &tokio_postgres::Error) -> (String, Option<String>) {
    match e.as_db_error() {
        Some(db) => {
            let mut message = db.message().to_string();
            if let Some(detail) = db.detail() {
                message.push_str("\nDETAIL: ");
                message.push_str(detail);
            }
            (message, Some(db.code().code().to_string()))
        }
        None => (e.to_string(), None),
    }
}

fn failed(index: usize, sql: &str, error: String, sqlstate: Option<String>) -> StatementOutcome {
    StatementOutcome {
        index,
        status: StatementStatus::Failed {
            statement: preview(sql),
            error,
            sqlstate,
        },
    }
}

fn mark_rolled_back(results: &mut [StatementOutcome]) {
    for outcome in results.iter_mut() {
        if outcome.status == StatementStatus::Executed {
            outcome.status = StatementStatus::RolledBack;
        }
    }
}

fn first_column(messages: Vec<SimpleQueryMessage>) -> Vec<String> {
    messages
        .into_iter()
        .filter_map(|m| match m {
            SimpleQueryMessage::Row(row) => row.get(0).map(str::to_string),
            _ => None,
        })
        .collect()
}
