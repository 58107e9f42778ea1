//! # pgdump-import
//!
//! Phase-ordered import engine for plain-text `pg_dump` SQL files.
//!
//! This library takes a dump from raw text to a verified target database:
//!
//! - **Parsing** into typed statements with dump metadata and row estimates
//! - **Integrity checks** that detect truncated or corrupted dumps, with repair
//! - **Phased execution** (schema, data, constraints, indexes, functions,
//!   policies) in bounded batches, with pause, resume and cancel
//! - **Error classification** into a stable numeric taxonomy
//! - **Schema alignment** for drifted targets, with full rollback
//! - **Verification** of row counts, content checksums and FK orphans
//! - **JSON reports** of every session
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use pgdump_import::{export_report, load_dump, Config, Orchestrator, PgChannel};
//! use pgdump_import::verify::expected_counts;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("import.yaml")?;
//!     let parsed = load_dump("backup.sql")?;
//!
//!     let channel = Arc::new(PgChannel::new());
//!     let mut orchestrator = Orchestrator::from_config(channel, &config);
//!     let summary = orchestrator.start_import(&parsed).await?;
//!     println!("{}", export_report(&summary)?);
//!
//!     let results = orchestrator
//!         .verify_engine()
//!         .verify(&expected_counts(&parsed))
//!         .await;
//!     println!("{} tables match", results.iter().filter(|r| r.matches).count());
//!     Ok(())
//! }
//! ```

pub mod align;
pub mod channel;
pub mod classifier;
pub mod config;
pub mod control;
pub mod core;
pub mod error;
pub mod integrity;
pub mod orchestrator;
pub mod parser;
pub mod report;
pub mod session;
pub mod verify;

#[cfg(test)]
mod testing;

// Re-exports for convenient access
pub use align::{AlignmentChange, RollbackOutcome, SchemaAligner};
pub use channel::postgres::PgChannel;
pub use channel::{ExecuteOptions, ExecuteResult, ExecutionChannel};
pub use classifier::{classify_error, Classification, ErrorCategory, ErrorSeverity};
pub use config::{
    AlignmentConfig, CategoryOptions, Config, ConnectionConfig, DropIfExistsConfig, ExecutionOrder,
    ImportOptions, OnConflict, ResumePoint, SslMode,
};
pub use control::{ControlState, ImportController};
pub use error::{DumpImportError, Result};
pub use integrity::{check_file_integrity, repair, IntegrityIssue, RepairMode, RepairResult};
pub use orchestrator::Orchestrator;
pub use parser::{load_dump, parse_dump, rewrite_drop, ParsedSqlFile, Statement, StatementKind};
pub use report::{export_report, ImportReport};
pub use session::{ImportCheckpoint, ImportEvent, ImportProgress, ImportStatus, ImportSummary};
pub use verify::{VerificationResult, VerifyEngine};
