//! Records produced by one import session.
//!
//! Everything here is created when a session starts and owned by the
//! orchestrator until the session ends. Consumers only ever see clones:
//! progress snapshots, streamed [`ImportEvent`]s and the final
//! [`ImportSummary`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, error, info, warn};

use crate::classifier::{self, Classification, ErrorCategory, ErrorSeverity};
use crate::config::ResumePoint;
use crate::control::ControlState;
use crate::parser::StatementKind;

/// Named stage of import execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportPhase {
    Schema,
    Data,
    Constraints,
    Indexes,
    Functions,
    Policies,
}

impl ImportPhase {
    /// Phase a statement of `kind` is reported under.
    pub fn of_kind(kind: StatementKind) -> Self {
        match kind {
            StatementKind::SchemaDdl | StatementKind::TableDdl | StatementKind::Enum => {
                ImportPhase::Schema
            }
            StatementKind::DataDml => ImportPhase::Data,
            StatementKind::Constraint => ImportPhase::Constraints,
            StatementKind::Index => ImportPhase::Indexes,
            StatementKind::Function => ImportPhase::Functions,
            StatementKind::Policy | StatementKind::Trigger => ImportPhase::Policies,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ImportPhase::Schema => "schema",
            ImportPhase::Data => "data",
            ImportPhase::Constraints => "constraints",
            ImportPhase::Indexes => "indexes",
            ImportPhase::Functions => "functions",
            ImportPhase::Policies => "policies",
        }
    }
}

impl fmt::Display for ImportPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Point-in-time view of a running import.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportProgress {
    pub current_phase: Option<ImportPhase>,
    pub statements_executed: usize,
    pub statements_failed: usize,
    /// Statements omitted because their table already existed.
    pub statements_skipped: usize,
    pub total_statements: usize,
    pub elapsed_ms: u64,
    /// 1-based batch being executed.
    pub current_batch: usize,
    pub total_batches: usize,
}

impl ImportProgress {
    /// Statements that have reached a final outcome.
    pub fn processed(&self) -> usize {
        self.statements_executed + self.statements_failed
    }

    pub fn percent_complete(&self) -> f64 {
        if self.total_statements == 0 {
            return 0.0;
        }
        (self.processed() + self.statements_skipped) as f64 * 100.0 / self.total_statements as f64
    }
}

/// One failed statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportError {
    pub statement_index: usize,
    pub statement: String,
    pub error: String,
    pub timestamp: DateTime<Utc>,
    pub phase: ImportPhase,
    #[serde(with = "category_code")]
    pub category: ErrorCategory,
    pub severity: ErrorSeverity,
    /// Same value as `category`, kept for report consumers.
    pub code: u16,
}

impl ImportError {
    pub fn new(
        statement_index: usize,
        statement: impl Into<String>,
        error: impl Into<String>,
        phase: ImportPhase,
        classification: Classification,
    ) -> Self {
        Self {
            statement_index,
            statement: statement.into(),
            error: error.into(),
            timestamp: Utc::now(),
            phase,
            category: classification.category,
            severity: classification.severity,
            code: classification.code(),
        }
    }
}

mod category_code {
    use serde::{de::Error as _, Deserialize, Deserializer, Serializer};

    use crate::classifier::ErrorCategory;

    pub fn serialize<S: Serializer>(category: &ErrorCategory, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u16(category.code())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<ErrorCategory, D::Error> {
        let code = u16::deserialize(d)?;
        ErrorCategory::from_code(code)
            .ok_or_else(|| D::Error::custom(format!("unknown error category code {}", code)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Success,
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
            LogLevel::Success => "success",
        };
        f.write_str(s)
    }
}

/// Operator-facing journal entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportLog {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// Terminal outcome of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImportStatus {
    Success,
    Partial,
    Failed,
    Cancelled,
}

impl fmt::Display for ImportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ImportStatus::Success => "success",
            ImportStatus::Partial => "partial",
            ImportStatus::Failed => "failed",
            ImportStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhaseStats {
    pub executed: usize,
    pub failed: usize,
}

/// Timing and counts of one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PhaseMetrics {
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub executed: usize,
    pub failed: usize,
}

impl PhaseMetrics {
    fn started(at: DateTime<Utc>) -> Self {
        Self {
            start_time: at,
            end_time: at,
            duration_ms: 0,
            executed: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportMetrics {
    pub phases: BTreeMap<ImportPhase, PhaseMetrics>,
    pub total_duration_ms: u64,
}

impl ImportMetrics {
    /// Open `phase` now unless it is already open.
    ///
    /// Called before a phase's first batch is dispatched so its duration
    /// covers that batch's round trip.
    pub(crate) fn begin(&mut self, phase: ImportPhase) {
        self.phases
            .entry(phase)
            .or_insert_with(|| PhaseMetrics::started(Utc::now()));
    }

    /// Account one statement outcome to `phase`.
    pub(crate) fn record(&mut self, phase: ImportPhase, succeeded: bool) {
        let now = Utc::now();
        let entry = self
            .phases
            .entry(phase)
            .or_insert_with(|| PhaseMetrics::started(now));
        if succeeded {
            entry.executed += 1;
        } else {
            entry.failed += 1;
        }
        entry.end_time = now;
        entry.duration_ms = (now - entry.start_time).num_milliseconds().max(0) as u64;
    }

    pub fn phase_stats(&self) -> BTreeMap<ImportPhase, PhaseStats> {
        self.phases
            .iter()
            .map(|(phase, m)| {
                (
                    *phase,
                    PhaseStats {
                        executed: m.executed,
                        failed: m.failed,
                    },
                )
            })
            .collect()
    }
}

/// Terminal snapshot of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportSummary {
    pub session_id: String,
    pub status: ImportStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub duration_ms: u64,
    pub statements_executed: usize,
    pub statements_failed: usize,
    pub statements_skipped: usize,
    pub total_statements: usize,
    pub errors: Vec<ImportError>,
    pub logs: Vec<ImportLog>,
    pub phases: BTreeMap<ImportPhase, PhaseStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ImportMetrics>,
}

impl ImportSummary {
    /// Executed statements as a percentage of those that ran.
    pub fn success_rate(&self) -> f64 {
        let ran = self.statements_executed + self.statements_failed;
        if ran == 0 {
            return 0.0;
        }
        self.statements_executed as f64 * 100.0 / ran as f64
    }

    /// Error counts per category, for the operator overview.
    pub fn error_categories(&self) -> BTreeMap<ErrorCategory, usize> {
        classifier::summarize(self.errors.iter().map(|e| e.category))
    }
}

/// Position of the last batch that completed, so an interrupted import can
/// be restarted with [`ImportOptions::resume_from`](crate::config::ImportOptions).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportCheckpoint {
    pub session_id: String,
    pub phase: ImportPhase,
    /// Batches of `phase` completed so far.
    pub batch: usize,
    pub total_batches: usize,
    pub statements_executed: usize,
    pub statements_failed: usize,
    pub timestamp: DateTime<Utc>,
}

impl ImportCheckpoint {
    /// Where a new session should pick up.
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            phase: self.phase,
            batch_index: self.batch,
        }
    }
}

/// Streamed to hosts that subscribed with `Orchestrator::with_events`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ImportEvent {
    Status(ControlState),
    Progress(ImportProgress),
    Log(ImportLog),
    Error(ImportError),
    PhaseStarted(ImportPhase),
    Checkpoint(ImportCheckpoint),
}

/// Append-only log and error lists for one session.
///
/// Every entry is mirrored to `tracing` and, when a sender is attached,
/// forwarded as an [`ImportEvent`].
#[derive(Debug, Default)]
pub struct Journal {
    logs: Vec<ImportLog>,
    errors: Vec<ImportError>,
    events: Option<mpsc::Sender<ImportEvent>>,
    dropped_events: usize,
}

impl Journal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_events(events: Option<mpsc::Sender<ImportEvent>>) -> Self {
        Self {
            events,
            ..Self::default()
        }
    }

    pub fn info(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Info, message, None);
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Warn, message, None);
    }

    pub fn error(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Error, message, None);
    }

    pub fn success(&mut self, message: impl Into<String>) {
        self.log(LogLevel::Success, message, None);
    }

    pub fn log(&mut self, level: LogLevel, message: impl Into<String>, details: Option<String>) {
        let entry = ImportLog {
            timestamp: Utc::now(),
            level,
            message: message.into(),
            details,
        };
        match level {
            LogLevel::Info | LogLevel::Success => info!("{}", entry.message),
            LogLevel::Warn => warn!("{}", entry.message),
            LogLevel::Error => error!("{}", entry.message),
        }
        if let Some(details) = &entry.details {
            debug!("{}", details);
        }
        self.emit(ImportEvent::Log(entry.clone()));
        self.logs.push(entry);
    }

    pub fn record_error(&mut self, error: ImportError) {
        warn!(
            "Statement {} failed [{}]: {}",
            error.statement_index, error.category, error.error
        );
        self.emit(ImportEvent::Error(error.clone()));
        self.errors.push(error);
    }

    /// Forward `event` without waiting. A full or closed receiver loses it.
    pub fn emit(&mut self, event: ImportEvent) {
        let Some(tx) = &self.events else {
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                if self.dropped_events == 0 {
                    warn!("Import event receiver is not keeping up; dropping events");
                }
                self.dropped_events += 1;
                debug!("Dropped import event ({} so far)", self.dropped_events);
            }
            Err(TrySendError::Closed(_)) => {
                debug!("Import event receiver closed; no further events are sent");
                self.events = None;
            }
        }
    }

    /// Events lost because the receiver's buffer was full.
    pub fn dropped_events(&self) -> usize {
        self.dropped_events
    }

    pub fn logs(&self) -> &[ImportLog] {
        &self.logs
    }

    pub fn errors(&self) -> &[ImportError] {
        &self.errors
    }

    pub fn into_parts(self) -> (Vec<ImportLog>, Vec<ImportError>) {
        (self.logs, self.errors)
    }
}
