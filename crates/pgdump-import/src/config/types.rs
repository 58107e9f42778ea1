//! Configuration type definitions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::channel::tls::SslMode;
use crate::parser::StatementKind;
use crate::session::ImportPhase;

/// Root configuration structure.
///
/// Persisting it is the host's business; the engine receives one at
/// session start and never writes it back.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Target database connection.
    pub connection: ConnectionConfig,

    /// Import behavior.
    #[serde(default)]
    pub options: ImportOptions,

    /// Which dump sections to execute.
    #[serde(default)]
    pub categories: CategoryOptions,

    /// Schema alignment behavior.
    #[serde(default)]
    pub alignment: AlignmentConfig,
}

/// Target database connection settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Database host.
    pub host: String,

    /// Database port (default: 5432).
    #[serde(default = "default_pg_port")]
    pub port: u16,

    /// Database name.
    pub database: String,

    /// Username.
    pub user: String,

    /// Password.
    #[serde(default)]
    pub password: String,

    /// SSL mode; accepts a boolean or a mode name.
    #[serde(default)]
    pub ssl: SslMode,

    /// Seconds to wait for a connection (default: 30).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Server-side statement timeout applied to every session, if set.
    #[serde(default)]
    pub statement_timeout_ms: Option<u64>,
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("ssl", &self.ssl)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("statement_timeout_ms", &self.statement_timeout_ms)
            .finish()
    }
}

impl ConnectionConfig {
    /// Minimal connection with defaults for everything but the essentials.
    pub fn new(
        host: impl Into<String>,
        database: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: default_pg_port(),
            database: database.into(),
            user: user.into(),
            password: password.into(),
            ssl: SslMode::default(),
            connect_timeout_secs: default_connect_timeout(),
            statement_timeout_ms: None,
        }
    }

    /// Stable key identifying the server/database/user triple.
    pub fn pool_key(&self) -> String {
        format!(
            "{}:{}/{}?user={}&ssl={}",
            self.host, self.port, self.database, self.user, self.ssl
        )
    }
}

/// Order in which statement phases are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionOrder {
    /// Schema, data, constraints, indexes, functions, policies.
    #[default]
    SchemaFirst,
    /// Statements run exactly as the dump lists them.
    FileOrder,
    /// Schema, data, indexes, constraints, functions, policies.
    DataFirst,
}

/// Row-level conflict policy handed to the execution channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OnConflict {
    /// Let the database raise the conflict.
    #[default]
    Error,
    /// Keep the existing row.
    Skip,
    /// Overwrite the existing row.
    Update,
}

/// Import behavior configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImportOptions {
    /// When false, a schema-first order degrades to file order.
    #[serde(default = "default_true")]
    pub execute_schema_first: bool,

    /// Any single failure ends the session as failed.
    #[serde(default = "default_true")]
    pub stop_on_first_error: bool,

    /// Wrap each batch in its own transaction.
    #[serde(default = "default_true")]
    pub use_transactions: bool,

    /// Statements per execution-channel call (10..=500).
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Omit CREATE TABLE for tables that already exist in the target.
    #[serde(default)]
    pub skip_existing_tables: bool,

    /// Validate every statement before the first mutating call.
    #[serde(default = "default_true")]
    pub dry_run_first: bool,

    #[serde(default)]
    pub execution_order: ExecutionOrder,

    #[serde(default)]
    pub on_conflict: OnConflict,

    /// Retries for transient batch failures (timeouts, lock conflicts).
    #[serde(default)]
    pub retry_attempts: u32,

    /// Initial retry delay, doubled for each further attempt.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// Drop OWNER TO, GRANT and REVOKE statements before planning.
    #[serde(default)]
    pub skip_ownership_statements: bool,

    /// Order data statements so referenced tables load before referencing ones.
    #[serde(default = "default_true")]
    pub reorder_data_by_dependencies: bool,

    /// Start even when the dump has integrity errors.
    #[serde(default)]
    pub override_integrity_errors: bool,

    /// Tables verified concurrently by the verification engine.
    #[serde(default = "default_verify_concurrency")]
    pub verify_concurrency: usize,

    /// Skip everything a previous session already completed.
    #[serde(default)]
    pub resume_from: Option<ResumePoint>,

    #[serde(default)]
    pub drop_if_exists: DropIfExistsConfig,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            execute_schema_first: true,
            stop_on_first_error: true,
            use_transactions: true,
            batch_size: default_batch_size(),
            skip_existing_tables: false,
            dry_run_first: true,
            execution_order: ExecutionOrder::default(),
            on_conflict: OnConflict::default(),
            retry_attempts: 0,
            retry_backoff_ms: default_retry_backoff_ms(),
            skip_ownership_statements: false,
            reorder_data_by_dependencies: true,
            override_integrity_errors: false,
            verify_concurrency: default_verify_concurrency(),
            resume_from: None,
            drop_if_exists: DropIfExistsConfig::default(),
        }
    }
}

impl ImportOptions {
    /// Execution order after applying `execute_schema_first`.
    pub fn effective_order(&self) -> ExecutionOrder {
        match self.execution_order {
            ExecutionOrder::SchemaFirst if !self.execute_schema_first => ExecutionOrder::FileOrder,
            order => order,
        }
    }
}

/// Where an interrupted import picks up again, usually taken from
/// [`ImportCheckpoint::resume_point`](crate::session::ImportCheckpoint::resume_point).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub phase: ImportPhase,
    /// Batches of `phase` already completed.
    pub batch_index: usize,
}

/// Rewriting of `DROP TABLE|INDEX|SEQUENCE|VIEW` into the `IF EXISTS` form,
/// so re-importing into a partly populated target does not fail on objects
/// that are not there yet.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DropIfExistsConfig {
    /// Rewrite at all. When false every DROP runs as written.
    #[serde(default)]
    pub allow_schema_drop: bool,

    /// Only objects in these schemas are rewritten.
    #[serde(default = "default_allowed_schemas")]
    pub safe_schemas: Vec<String>,

    /// Append CASCADE to rewritten statements that name no drop behavior.
    #[serde(default)]
    pub cascade: bool,
}

impl Default for DropIfExistsConfig {
    fn default() -> Self {
        Self {
            allow_schema_drop: false,
            safe_schemas: default_allowed_schemas(),
            cascade: false,
        }
    }
}

/// Dump sections selected for execution.
///
/// `all` overrides the individual flags. Edge functions and secrets are not
/// carried by SQL dumps; the flags exist so hosts can round-trip their
/// full selection through one struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryOptions {
    #[serde(default = "default_true")]
    pub all: bool,
    #[serde(default = "default_true")]
    pub schema: bool,
    #[serde(default = "default_true")]
    pub constraints: bool,
    #[serde(default = "default_true")]
    pub indexes: bool,
    #[serde(default = "default_true")]
    pub db_functions: bool,
    #[serde(default = "default_true")]
    pub rls_policies: bool,
    #[serde(default = "default_true")]
    pub enums: bool,
    #[serde(default = "default_true")]
    pub edge_functions: bool,
    #[serde(default = "default_true")]
    pub secrets: bool,
    #[serde(default = "default_true")]
    pub table_data: bool,
}

impl Default for CategoryOptions {
    fn default() -> Self {
        Self {
            all: true,
            schema: true,
            constraints: true,
            indexes: true,
            db_functions: true,
            rls_policies: true,
            enums: true,
            edge_functions: true,
            secrets: true,
            table_data: true,
        }
    }
}

impl CategoryOptions {
    /// Nothing selected; enable flags individually.
    pub fn none() -> Self {
        Self {
            all: false,
            schema: false,
            constraints: false,
            indexes: false,
            db_functions: false,
            rls_policies: false,
            enums: false,
            edge_functions: false,
            secrets: false,
            table_data: false,
        }
    }

    /// Whether statements of this kind should be executed.
    pub fn includes(&self, kind: StatementKind) -> bool {
        if self.all {
            return true;
        }
        match kind {
            StatementKind::SchemaDdl | StatementKind::TableDdl => self.schema,
            StatementKind::DataDml => self.table_data,
            StatementKind::Constraint => self.constraints,
            StatementKind::Index => self.indexes,
            StatementKind::Function | StatementKind::Trigger => self.db_functions,
            StatementKind::Policy => self.rls_policies,
            StatementKind::Enum => self.enums,
        }
    }
}

/// Schema alignment configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentConfig {
    /// Run the stager before the first phase.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Schemas the stager may change.
    #[serde(default = "default_allowed_schemas")]
    pub allowed_schemas: Vec<String>,

    /// `schema.table` names never touched.
    #[serde(default)]
    pub excluded_tables: Vec<String>,

    /// `schema.table.column` names that must end up NOT NULL.
    #[serde(default)]
    pub required_not_null_columns: Vec<String>,

    /// Drop NOT NULL on target columns the dump never supplies and that have
    /// no default, so the dump's inserts can succeed.
    #[serde(default = "default_true")]
    pub relax_missing_not_null: bool,

    #[serde(default)]
    pub heuristics: AlignmentHeuristics,
}

impl Default for AlignmentConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            allowed_schemas: default_allowed_schemas(),
            excluded_tables: Vec::new(),
            required_not_null_columns: Vec::new(),
            relax_missing_not_null: true,
            heuristics: AlignmentHeuristics::default(),
        }
    }
}

impl AlignmentConfig {
    /// Disabled alignment.
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }
}

/// Tuning knobs for Stage 1 / Stage 2 decisions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlignmentHeuristics {
    /// Backfill NULLs with the column default after adding it.
    #[serde(default = "default_true")]
    pub backfill_with_default: bool,

    /// Promote a column with a default to NOT NULL once no NULLs remain.
    #[serde(default = "default_true")]
    pub allow_not_null_when_default: bool,

    /// Promote any dump-declared NOT NULL column once no NULLs remain.
    #[serde(default)]
    pub allow_not_null_when_no_nulls: bool,
}

impl Default for AlignmentHeuristics {
    fn default() -> Self {
        Self {
            backfill_with_default: true,
            allow_not_null_when_default: true,
            allow_not_null_when_no_nulls: false,
        }
    }
}

// Default value functions

fn default_pg_port() -> u16 {
    5432
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

fn default_batch_size() -> usize {
    100
}

fn default_retry_backoff_ms() -> u64 {
    500
}

fn default_verify_concurrency() -> usize {
    4
}

fn default_allowed_schemas() -> Vec<String> {
    vec!["public".to_string()]
}
