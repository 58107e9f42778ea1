//! Import orchestrator - runs a parsed dump against the target, phase by phase.

pub mod plan;
mod reorder;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::align::{RollbackOutcome, SchemaAligner};
use crate::channel::{ExecuteOptions, ExecuteResult, ExecutionChannel, StatementStatus};
use crate::classifier::{classify, classify_error, Classification};
use crate::config::{
    AlignmentConfig, CategoryOptions, Config, ConnectionConfig, ExecutionOrder, ImportOptions,
};
use crate::control::{ControlState, ImportController};
use crate::core::identifier::{quote_literal, TableRef};
use crate::error::{DumpImportError, Result};
use crate::parser::{
    implied_schema, is_ownership, rewrite_drop, ParsedSqlFile, Statement, StatementKind,
};
use crate::session::{
    ImportCheckpoint, ImportError, ImportEvent, ImportMetrics, ImportProgress, ImportStatus,
    ImportSummary, Journal, LogLevel,
};
use crate::verify::VerifyEngine;

pub use plan::{build_plan, Batch, ExecutionPlan, PlannedStatement};

/// Recorded for statements undone because a later statement in the same
/// transaction failed.
const ROLLED_BACK: &str =
    "current transaction is aborted; statement rolled back with its batch";

/// Runs import sessions against one target connection.
pub struct Orchestrator {
    channel: Arc<dyn ExecutionChannel>,
    connection: ConnectionConfig,
    options: ImportOptions,
    categories: CategoryOptions,
    aligner: Option<SchemaAligner>,
    controller: ImportController,
    events: Option<mpsc::Sender<ImportEvent>>,
    last_run: Option<LastRun>,
}

/// What a finished session leaves behind for a rerun.
struct LastRun {
    parsed: ParsedSqlFile,
    summary: ImportSummary,
    failed: Vec<PlannedStatement>,
    checkpoint: Option<ImportCheckpoint>,
}

/// Mutable state of one running session.
struct Session<'p> {
    id: String,
    parsed: &'p ParsedSqlFile,
    journal: Journal,
    progress: ImportProgress,
    metrics: ImportMetrics,
    started: Instant,
    start_time: DateTime<Utc>,
    failed: Vec<PlannedStatement>,
    existing_tables: HashMap<String, bool>,
    /// A connection-level or otherwise fatal error was seen.
    fatal: bool,
    /// Stop-on-first-error fired.
    stopped: bool,
    /// Last completed batch position. Reruns do not track one.
    checkpoint: Option<ImportCheckpoint>,
    track_checkpoints: bool,
}

impl<'p> Session<'p> {
    fn new(id: String, parsed: &'p ParsedSqlFile, journal: Journal) -> Self {
        Self {
            id,
            parsed,
            journal,
            progress: ImportProgress::default(),
            metrics: ImportMetrics::default(),
            started: Instant::now(),
            start_time: Utc::now(),
            failed: Vec::new(),
            existing_tables: HashMap::new(),
            fatal: false,
            stopped: false,
            checkpoint: None,
            track_checkpoints: true,
        }
    }

    fn statement(&self, item: &PlannedStatement) -> &'p Statement {
        &self.parsed.statements[item.index]
    }

    fn publish(&mut self, controller: &ImportController) {
        self.progress.elapsed_ms = self.started.elapsed().as_millis() as u64;
        controller.publish_progress(&self.progress);
        self.journal.emit(ImportEvent::Progress(self.progress.clone()));
    }

    fn succeeded(&mut self, item: &PlannedStatement, controller: &ImportController) {
        self.progress.statements_executed += 1;
        self.metrics.record(item.phase, true);
        self.publish(controller);
    }

    fn failed(
        &mut self,
        item: &PlannedStatement,
        error: &str,
        classification: Classification,
        controller: &ImportController,
    ) {
        let stmt = self.statement(item);
        self.progress.statements_failed += 1;
        self.metrics.record(item.phase, false);
        self.journal.record_error(ImportError::new(
            item.index,
            crate::channel::preview(&stmt.text),
            error,
            item.phase,
            classification,
        ));
        if classification.severity.is_session_fatal() {
            self.fatal = true;
        }
        self.failed.push(*item);
        self.publish(controller);
    }

    /// Record that `batch` of `plan` completed.
    fn save_checkpoint(&mut self, plan: &ExecutionPlan, batch: &Batch) {
        let Some(phase) = batch.phase() else {
            return;
        };
        let total_batches = plan
            .batches
            .iter()
            .filter(|b| b.phase() == Some(phase))
            .map(|b| b.ordinal + 1)
            .max()
            .unwrap_or(0);
        let checkpoint = ImportCheckpoint {
            session_id: self.id.clone(),
            phase,
            batch: batch.ordinal + 1,
            total_batches,
            statements_executed: self.progress.statements_executed,
            statements_failed: self.progress.statements_failed,
            timestamp: Utc::now(),
        };
        debug!("Checkpoint: {} batch {}/{}", phase, checkpoint.batch, total_batches);
        self.journal.emit(ImportEvent::Checkpoint(checkpoint.clone()));
        self.checkpoint = Some(checkpoint);
    }

    fn into_summary(self, status: ImportStatus) -> ImportSummary {
        let duration_ms = self.started.elapsed().as_millis() as u64;
        let mut metrics = self.metrics;
        metrics.total_duration_ms = duration_ms;
        let (logs, errors) = self.journal.into_parts();
        ImportSummary {
            session_id: self.id,
            status,
            start_time: self.start_time,
            end_time: Utc::now(),
            duration_ms,
            statements_executed: self.progress.statements_executed,
            statements_failed: self.progress.statements_failed,
            statements_skipped: self.progress.statements_skipped,
            total_statements: self.progress.total_statements,
            errors,
            logs,
            phases: metrics.phase_stats(),
            metrics: Some(metrics),
        }
    }
}

impl Orchestrator {
    /// Create an orchestrator with default categories and no schema alignment.
    pub fn new(
        channel: Arc<dyn ExecutionChannel>,
        connection: ConnectionConfig,
        options: ImportOptions,
    ) -> Self {
        Self {
            channel,
            connection,
            options,
            categories: CategoryOptions::default(),
            aligner: None,
            controller: ImportController::new(),
            events: None,
            last_run: None,
        }
    }

    /// Create an orchestrator from a loaded configuration file.
    pub fn from_config(channel: Arc<dyn ExecutionChannel>, config: &Config) -> Self {
        Self::new(channel, config.connection.clone(), config.options.clone())
            .with_categories(config.categories.clone())
            .with_alignment(config.alignment.clone())
    }

    pub fn with_categories(mut self, categories: CategoryOptions) -> Self {
        self.categories = categories;
        self
    }

    /// Enable two-stage schema alignment around the import.
    pub fn with_alignment(mut self, alignment: AlignmentConfig) -> Self {
        self.aligner = alignment.enabled.then(|| {
            SchemaAligner::new(self.channel.clone(), self.connection.clone(), alignment)
        });
        self
    }

    /// Stream status, progress, log and error events to `events`.
    pub fn with_events(mut self, events: mpsc::Sender<ImportEvent>) -> Self {
        self.events = Some(events);
        self
    }

    /// Handle for pausing, resuming and cancelling from another task.
    pub fn controller(&self) -> ImportController {
        self.controller.clone()
    }

    pub fn options(&self) -> &ImportOptions {
        &self.options
    }

    pub fn last_summary(&self) -> Option<&ImportSummary> {
        self.last_run.as_ref().map(|r| &r.summary)
    }

    /// Position reached by the last session. Feed
    /// [`ImportCheckpoint::resume_point`] into `resume_from` to continue it.
    pub fn last_checkpoint(&self) -> Option<&ImportCheckpoint> {
        self.last_run.as_ref().and_then(|r| r.checkpoint.as_ref())
    }

    /// Verification engine for the same target, honoring
    /// `verify_concurrency`.
    pub fn verify_engine(&self) -> VerifyEngine {
        VerifyEngine::new(self.channel.clone(), self.connection.clone())
            .with_concurrency(self.options.verify_concurrency)
    }

    pub fn aligner(&self) -> Option<&SchemaAligner> {
        self.aligner.as_ref()
    }

    /// Run a parsed dump to completion.
    ///
    /// Returns an error only when the session cannot start. Statement
    /// failures are reported in the summary.
    pub async fn start_import(&mut self, parsed: &ParsedSqlFile) -> Result<ImportSummary> {
        self.options.validate()?;
        if parsed.has_blocking_issues() && !self.options.override_integrity_errors {
            let issues: Vec<&str> = parsed
                .blocking_issues()
                .iter()
                .map(|i| i.description.as_str())
                .collect();
            return Err(DumpImportError::IntegrityBlocked(issues.join("; ")));
        }
        if self.controller.state().is_terminal() {
            self.controller.reset()?;
        }
        self.controller.start()?;

        let session_id = Uuid::new_v4().to_string();
        info!("Starting import session {}", session_id);
        let mut session =
            Session::new(session_id, parsed, Journal::with_events(self.events.clone()));
        session.journal.emit(ImportEvent::Status(ControlState::Executing));

        if parsed.has_blocking_issues() {
            session
                .journal
                .warn("Integrity errors overridden; importing a possibly incomplete dump");
        }

        let status = self.run(&mut session).await;
        let status = self.finish(&mut session, status);

        let failed = std::mem::take(&mut session.failed);
        let checkpoint = session.checkpoint.take();
        let summary = session.into_summary(status);
        self.last_run = Some(LastRun {
            parsed: parsed.clone(),
            summary: summary.clone(),
            failed,
            checkpoint,
        });
        Ok(summary)
    }

    /// Execute the statements that failed in the last session again.
    ///
    /// Only allowed after a `partial` session. Counts, errors and logs are
    /// merged into a new summary; earlier error records are kept.
    pub async fn rerun_failed_batches(&mut self) -> Result<ImportSummary> {
        let last = match self.last_run.take() {
            Some(last) if last.summary.status == ImportStatus::Partial => last,
            Some(last) => {
                let status = last.summary.status;
                self.last_run = Some(last);
                return Err(DumpImportError::invalid_state(
                    "rerun failed batches",
                    format!("finished with status {}", status),
                ));
            }
            None => {
                return Err(DumpImportError::invalid_state(
                    "rerun failed batches",
                    self.controller.state(),
                ))
            }
        };

        self.controller.reset()?;
        self.controller.start()?;

        let mut session = Session::new(
            last.summary.session_id.clone(),
            &last.parsed,
            Journal::with_events(self.events.clone()),
        );
        session.track_checkpoints = false;
        session.progress.total_statements = last.failed.len();
        let plan = ExecutionPlan::chunked(&last.failed, self.options.batch_size);
        session.progress.total_batches = plan.batches.len();
        session.journal.info(format!(
            "Re-running {} failed statements in {} batches",
            plan.total_statements,
            plan.batches.len()
        ));

        self.execute_plan(&mut session, &plan).await;
        let status = self.terminal_status(&session);
        let status = self.finish(&mut session, status);

        let failed = std::mem::take(&mut session.failed);
        let rerun = session.into_summary(status);
        let summary = merge_rerun(last.summary, rerun);
        self.last_run = Some(LastRun {
            parsed: last.parsed,
            summary: summary.clone(),
            failed,
            checkpoint: last.checkpoint,
        });
        Ok(summary)
    }

    /// Undo every schema alignment change recorded so far.
    pub async fn rollback_alignment(&mut self) -> Result<RollbackOutcome> {
        if matches!(
            self.controller.state(),
            ControlState::Executing | ControlState::Paused
        ) {
            return Err(DumpImportError::invalid_state(
                "roll back alignment",
                self.controller.state(),
            ));
        }
        match self.aligner.as_mut() {
            Some(aligner) => aligner.rollback().await,
            None => Ok(RollbackOutcome::nothing_to_do()),
        }
    }

    async fn run(&mut self, session: &mut Session<'_>) -> ImportStatus {
        let order = self.options.effective_order();
        let selected = self.select(session);
        let mut plan = build_plan(&selected, order, self.options.batch_size);
        if let Some(point) = self.options.resume_from {
            match plan.resume_position(&point) {
                Some(position) => {
                    let skipped = plan.skip_batches(position);
                    session.journal.log(
                        LogLevel::Info,
                        "Resuming import from checkpoint",
                        Some(format!(
                            "phase={}, batchIndex={}, skipping {} statements",
                            point.phase, point.batch_index, skipped
                        )),
                    );
                }
                None => session.journal.warn(format!(
                    "Checkpoint phase {} is not part of this import; starting from the beginning",
                    point.phase
                )),
            }
        }

        session.progress.total_statements = plan.total_statements;
        session.progress.total_batches = plan.batches.len();
        session.publish(&self.controller);
        session.journal.log(
            LogLevel::Info,
            format!(
                "Starting import of {} statements in {} batches",
                plan.total_statements,
                plan.batches.len()
            ),
            Some(format!(
                "order: {:?}, batch size: {}, transactions: {}",
                order, self.options.batch_size, self.options.use_transactions
            )),
        );

        if self.options.dry_run_first && !self.dry_run(session, &plan).await {
            return if self.controller.is_cancelled() {
                ImportStatus::Cancelled
            } else {
                ImportStatus::Failed
            };
        }

        let dump_schema = if self.aligner.is_some() {
            implied_schema(session.parsed)
        } else {
            Vec::new()
        };

        if let Some(aligner) = self.aligner.as_mut() {
            let staged = match aligner.stage_one(&dump_schema, &mut session.journal).await {
                Ok(_) => aligner.stage_two(&mut session.journal).await,
                Err(e) => Err(e),
            };
            if let Err(e) = staged {
                session.journal.error(format!("Schema alignment failed: {}", e));
                return ImportStatus::Failed;
            }
        }

        self.execute_plan(session, &plan).await;
        self.terminal_status(session)
    }

    /// Apply category and ownership filters and order data statements.
    fn select<'p>(&self, session: &mut Session<'p>) -> Vec<&'p Statement> {
        let parsed = session.parsed;
        let mut excluded = 0usize;
        let mut ownership = 0usize;
        let mut rewritten = 0usize;

        let mut selected = Vec::with_capacity(parsed.statements.len());
        for stmt in &parsed.statements {
            if !self.categories.includes(stmt.kind) {
                excluded += 1;
            } else if self.options.skip_ownership_statements && is_ownership(&stmt.text) {
                ownership += 1;
            } else {
                if rewrite_drop(&stmt.text, &self.options.drop_if_exists).is_some() {
                    rewritten += 1;
                }
                selected.push(stmt);
            }
        }

        if excluded > 0 {
            session.journal.info(format!(
                "Excluded {} statements by category selection",
                excluded
            ));
        }
        if ownership > 0 {
            session
                .journal
                .info(format!("Skipped {} ownership/privilege statements", ownership));
        }
        if rewritten > 0 {
            session.journal.info(format!(
                "Rewrote {} DROP statements to DROP ... IF EXISTS",
                rewritten
            ));
        }

        let order = self.options.effective_order();
        if order == ExecutionOrder::FileOrder || !self.options.reorder_data_by_dependencies {
            return selected;
        }

        let (data, mut rest): (Vec<&Statement>, Vec<&Statement>) = selected
            .into_iter()
            .partition(|s| s.kind == StatementKind::DataDml);
        let edges = reorder::foreign_key_edges(&parsed.statements);
        rest.extend(reorder::order_data_statements(data, &edges));
        rest
    }

    /// Validate the whole plan inside rolled-back transactions.
    ///
    /// Returns false when the import must not continue.
    async fn dry_run(&self, session: &mut Session<'_>, plan: &ExecutionPlan) -> bool {
        session.journal.info("Running dry run validation");
        let options = ExecuteOptions {
            transactional: true,
            dry_run: true,
            stop_on_error: false,
            on_conflict: self.options.on_conflict,
        };

        let mut syntax_errors = 0usize;
        let mut other_errors = 0usize;
        for batch in &plan.batches {
            if self.controller.is_cancelled() {
                session.journal.warn("Cancelling import...");
                return false;
            }
            let texts = self.batch_texts(session, &batch.items);
            match self.channel.execute(&self.connection, &texts, &options).await {
                Err(e) if e.is_connection_level() => {
                    let message = e.to_string();
                    session.journal.error(format!("Dry run failed: {}", message));
                    for item in &batch.items {
                        session.failed(item, &message, classify_error(&message), &self.controller);
                    }
                    session.fatal = true;
                    return false;
                }
                Err(e) => {
                    other_errors += batch.len();
                    debug!("Dry run batch error: {}", e);
                }
                Ok(result) => {
                    if result.results.is_empty() && !result.success {
                        other_errors += batch.len();
                    }
                    for outcome in &result.results {
                        let StatementStatus::Failed { error, sqlstate, .. } = &outcome.status else {
                            continue;
                        };
                        let classification = classify(sqlstate.as_deref(), error);
                        if classification.category.is_syntax_level() {
                            syntax_errors += 1;
                            if let Some(item) = batch.items.get(outcome.index) {
                                session.failed(item, error, classification, &self.controller);
                            }
                        } else {
                            other_errors += 1;
                        }
                    }
                }
            }
        }

        if syntax_errors > 0 {
            session.journal.error(format!(
                "Dry run found {} syntax error(s); import aborted",
                syntax_errors
            ));
            return false;
        }
        if other_errors > 0 {
            session.journal.warn(format!(
                "Dry run reported {} non-syntax failure(s); continuing",
                other_errors
            ));
        } else {
            session.journal.success("Dry run passed");
        }
        true
    }

    async fn execute_plan(&self, session: &mut Session<'_>, plan: &ExecutionPlan) {
        for (number, batch) in plan.batches.iter().enumerate() {
            if !self.may_proceed(session).await {
                break;
            }

            if let Some(phase) = batch.phase() {
                if session.progress.current_phase != Some(phase) {
                    session.progress.current_phase = Some(phase);
                    session.journal.emit(ImportEvent::PhaseStarted(phase));
                    session.journal.info(format!("Starting {} phase", phase));
                }
            }
            session.progress.current_batch = number + 1;
            session.publish(&self.controller);

            self.run_batch(session, batch).await;
            if session.fatal || session.stopped {
                break;
            }
            if session.track_checkpoints {
                session.save_checkpoint(plan, batch);
            }
        }
    }

    /// Returns false when the session must stop dispatching.
    async fn may_proceed(&self, session: &mut Session<'_>) -> bool {
        match self.controller.state() {
            ControlState::Paused => {
                session.journal.info("Import paused");
                session.journal.emit(ImportEvent::Status(ControlState::Paused));
                match self.controller.wait_while_paused().await {
                    ControlState::Cancelled => {
                        session.journal.warn("Cancelling import...");
                        false
                    }
                    state => {
                        session.journal.info("Import resumed");
                        session.journal.emit(ImportEvent::Status(state));
                        true
                    }
                }
            }
            ControlState::Cancelled => {
                session.journal.warn("Cancelling import...");
                false
            }
            _ => true,
        }
    }

    async fn run_batch(&self, session: &mut Session<'_>, batch: &Batch) {
        let mut items = Vec::with_capacity(batch.len());
        for item in &batch.items {
            let stmt = session.statement(item);
            if self.options.skip_existing_tables && plan::is_table_creation(stmt) {
                if let Some(table) = &stmt.target {
                    if self.table_exists(session, table).await {
                        session.progress.statements_skipped += 1;
                        session
                            .journal
                            .info(format!("Skipping existing table {}", table));
                        session.publish(&self.controller);
                        continue;
                    }
                }
            }
            items.push(*item);
        }
        if items.is_empty() {
            return;
        }

        for item in &items {
            session.metrics.begin(item.phase);
        }
        let texts = self.batch_texts(session, &items);
        let options = ExecuteOptions {
            transactional: self.options.use_transactions,
            dry_run: false,
            stop_on_error: self.options.stop_on_first_error,
            on_conflict: self.options.on_conflict,
        };
        let outcome = self.execute_with_retry(session, &texts, &options).await;
        self.record(session, &items, outcome);

        if self.options.stop_on_first_error && !session.failed.is_empty() {
            session.stopped = true;
        }
    }

    fn record(
        &self,
        session: &mut Session<'_>,
        items: &[PlannedStatement],
        outcome: Result<ExecuteResult>,
    ) {
        let result = match outcome {
            Ok(result) if !(result.results.is_empty() && !result.success) => result,
            Ok(result) => {
                let message = result.error.unwrap_or_else(|| "batch failed".to_string());
                self.fail_batch(session, items, &message, false);
                return;
            }
            Err(e) => {
                let message = e.to_string();
                self.fail_batch(session, items, &message, e.is_connection_level());
                return;
            }
        };

        for (position, item) in items.iter().enumerate() {
            let status = result
                .results
                .iter()
                .find(|o| o.index == position)
                .map(|o| o.status.clone())
                .unwrap_or(if result.success {
                    StatementStatus::Executed
                } else {
                    StatementStatus::Skipped
                });

            match status {
                StatementStatus::Executed => session.succeeded(item, &self.controller),
                StatementStatus::Failed { error, sqlstate, .. } => {
                    let classification = classify(sqlstate.as_deref(), &error);
                    session.failed(item, &error, classification, &self.controller);
                }
                StatementStatus::RolledBack => {
                    session.failed(item, ROLLED_BACK, classify_error(ROLLED_BACK), &self.controller);
                }
                StatementStatus::Skipped => {}
            }
        }
    }

    fn fail_batch(
        &self,
        session: &mut Session<'_>,
        items: &[PlannedStatement],
        message: &str,
        connection_level: bool,
    ) {
        let classification = classify_error(message);
        session.journal.error(format!("Batch failed: {}", message));
        for item in items {
            session.failed(item, message, classification, &self.controller);
        }
        if connection_level || classification.category.is_connection_level() {
            session.fatal = true;
        }
    }

    async fn execute_with_retry(
        &self,
        session: &mut Session<'_>,
        texts: &[String],
        options: &ExecuteOptions,
    ) -> Result<ExecuteResult> {
        let mut attempt = 0u32;
        loop {
            let outcome = self.channel.execute(&self.connection, texts, options).await;
            if attempt >= self.options.retry_attempts || !is_retryable(&outcome) {
                return outcome;
            }
            let delay = self
                .options
                .retry_backoff_ms
                .saturating_mul(1u64 << attempt.min(16));
            attempt += 1;
            session.journal.warn(format!(
                "Transient failure, retrying batch in {} ms (attempt {}/{})",
                delay, attempt, self.options.retry_attempts
            ));
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
    }

    async fn table_exists(&self, session: &mut Session<'_>, table: &TableRef) -> bool {
        let key = table.qualified();
        if let Some(known) = session.existing_tables.get(&key) {
            return *known;
        }
        let exists = match table.quoted() {
            Ok(quoted) => {
                let sql = format!(
                    "SELECT to_regclass({}) IS NOT NULL AS present",
                    quote_literal(&quoted)
                );
                match self.channel.query(&self.connection, &sql).await {
                    Ok(result) => result
                        .first()
                        .and_then(|r| r.get_bool("present"))
                        .unwrap_or(false),
                    Err(e) => {
                        session
                            .journal
                            .warn(format!("Could not check whether {} exists: {}", table, e));
                        false
                    }
                }
            }
            Err(_) => false,
        };
        session.existing_tables.insert(key, exists);
        exists
    }

    fn terminal_status(&self, session: &Session<'_>) -> ImportStatus {
        if self.controller.is_cancelled() {
            ImportStatus::Cancelled
        } else if session.fatal || session.stopped {
            ImportStatus::Failed
        } else if session.progress.statements_failed > 0 {
            ImportStatus::Partial
        } else {
            ImportStatus::Success
        }
    }

    /// Move the controller to its terminal state and write the closing log.
    fn finish(&self, session: &mut Session<'_>, status: ImportStatus) -> ImportStatus {
        let state = self.controller.finish(status);
        let status = if state == ControlState::Cancelled {
            ImportStatus::Cancelled
        } else {
            status
        };

        let progress = &session.progress;
        match status {
            ImportStatus::Success => session.journal.success(format!(
                "Import completed successfully: {} statements executed",
                progress.statements_executed
            )),
            ImportStatus::Partial => session.journal.warn(format!(
                "Import completed with errors: {} executed, {} failed",
                progress.statements_executed, progress.statements_failed
            )),
            ImportStatus::Failed => session.journal.error(format!(
                "Import failed: {} executed, {} failed",
                progress.statements_executed, progress.statements_failed
            )),
            ImportStatus::Cancelled => session.journal.warn(format!(
                "Import cancelled after {} statements",
                progress.processed()
            )),
        }
        session.journal.emit(ImportEvent::Status(state));
        session.publish(&self.controller);
        let dropped = session.journal.dropped_events();
        if dropped > 0 {
            warn!("{} import events were dropped by a slow receiver", dropped);
        }
        status
    }

    /// Statement texts as dispatched, with DROP rewrites applied.
    fn batch_texts(&self, session: &Session<'_>, items: &[PlannedStatement]) -> Vec<String> {
        items
            .iter()
            .map(|i| {
                let text = &session.statement(i).text;
                rewrite_drop(text, &self.options.drop_if_exists).unwrap_or_else(|| text.clone())
            })
            .collect()
    }
}

/// Whether a batch outcome is worth another attempt: nothing was committed
/// and every failure is transient.
fn is_retryable(outcome: &Result<ExecuteResult>) -> bool {
    match outcome {
        Err(e) => classify_error(&e.to_string()).category.is_transient(),
        Ok(result) if result.success => false,
        Ok(result) => {
            if result
                .results
                .iter()
                .any(|o| o.status == StatementStatus::Executed)
            {
                return false;
            }
            let mut failures = result.failures().peekable();
            if failures.peek().is_none() {
                return result
                    .error
                    .as_deref()
                    .map_or(false, |e| classify_error(e).category.is_transient());
            }
            failures.all(|o| match &o.status {
                StatementStatus::Failed { error, sqlstate, .. } => {
                    classify(sqlstate.as_deref(), error).category.is_transient()
                }
                _ => false,
            })
        }
    }
}

/// Fold a rerun's outcome into the summary of the session it repaired.
fn merge_rerun(mut base: ImportSummary, rerun: ImportSummary) -> ImportSummary {
    let resolved = rerun.statements_executed + rerun.statements_skipped;
    base.statements_executed += rerun.statements_executed;
    base.statements_skipped += rerun.statements_skipped;
    base.statements_failed = base.statements_failed.saturating_sub(resolved);
    base.end_time = rerun.end_time;
    base.duration_ms += rerun.duration_ms;
    base.errors.extend(rerun.errors);
    base.logs.extend(rerun.logs);

    if let (Some(metrics), Some(rerun_metrics)) = (base.metrics.as_mut(), rerun.metrics.as_ref()) {
        for (phase, m) in &rerun_metrics.phases {
            if let Some(entry) = metrics.phases.get_mut(phase) {
                entry.executed += m.executed;
                entry.failed = entry.failed.saturating_sub(m.executed);
                entry.end_time = m.end_time;
            }
        }
        metrics.total_duration_ms = base.duration_ms;
        base.phases = metrics.phase_stats();
    }

    base.status = match rerun.status {
        ImportStatus::Cancelled | ImportStatus::Failed => rerun.status,
        _ if base.statements_failed == 0 => ImportStatus::Success,
        _ => ImportStatus::Partial,
    };
    base
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::classifier::ErrorCategory;
    use crate::testing::FakeChannel;

    const CLEAN: &str = "CREATE TABLE t(id int);\nINSERT INTO t VALUES (1),(2);\nCREATE INDEX idx ON t(id);\n";

    fn orchestrator(channel: &Arc<FakeChannel>, options: ImportOptions) -> Orchestrator {
        Orchestrator::new(
            channel.clone(),
            ConnectionConfig::new("localhost", "db", "user", "pw"),
            options,
        )
    }

    fn position(dispatched: &[String], needle: &str) -> usize {
        dispatched
            .iter()
            .position(|s| s.contains(needle))
            .unwrap_or_else(|| panic!("{} was never dispatched", needle))
    }

    #[tokio::test]
    async fn test_clean_import() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(CLEAN);
        let mut orch = orchestrator(&channel, ImportOptions::default());

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        assert_eq!(summary.statements_executed, 3);
        assert_eq!(summary.statements_failed, 0);
        assert_eq!(parsed.metadata.estimated_row_count, 2);
        assert_eq!(channel.dispatched().len(), 3);
        assert!(!channel.dry_runs().is_empty());
        assert_eq!(orch.controller().state(), ControlState::Completed);
        assert!((summary.success_rate() - 100.0).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_stop_on_first_error() {
        let channel = Arc::new(FakeChannel::new());
        channel.fail_on(
            "INSERT INTO t",
            "duplicate key value violates unique constraint \"t_pkey\"",
        );
        let parsed = ParsedSqlFile::parse(CLEAN);
        let mut orch = orchestrator(&channel, ImportOptions::default());

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Failed);
        assert_eq!(summary.statements_executed, 1);
        assert_eq!(summary.statements_failed, 1);
        assert!(!channel.dispatched().iter().any(|s| s.contains("CREATE INDEX")));

        let error = &summary.errors[0];
        assert_eq!(error.statement_index, 1);
        assert_eq!(error.category, ErrorCategory::ConstraintViolation);
        assert_eq!(orch.controller().state(), ControlState::Failed);
    }

    #[tokio::test]
    async fn test_partial_without_stop() {
        let channel = Arc::new(FakeChannel::new());
        channel.fail_on(
            "INSERT INTO t",
            "duplicate key value violates unique constraint \"t_pkey\"",
        );
        let parsed = ParsedSqlFile::parse(CLEAN);
        let options = ImportOptions {
            stop_on_first_error: false,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Partial);
        assert_eq!(summary.statements_executed, 2);
        assert_eq!(summary.statements_failed, 1);
        assert_eq!(channel.dispatched().len(), 3);
        assert_eq!(summary.error_categories().get(&ErrorCategory::ConstraintViolation), Some(&1));
    }

    #[tokio::test]
    async fn test_schema_first_runs_tables_before_data() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(
            "INSERT INTO public.child VALUES (1, 1);\n\
             INSERT INTO public.parent VALUES (1);\n\
             CREATE TABLE public.parent (id int PRIMARY KEY);\n\
             CREATE TABLE public.child (id int, parent_id int REFERENCES public.parent(id));\n",
        );
        let mut orch = orchestrator(&channel, ImportOptions::default());
        orch.start_import(&parsed).await.unwrap();

        let dispatched = channel.dispatched();
        let last_table = position(&dispatched, "CREATE TABLE public.child");
        let first_data = position(&dispatched, "INSERT INTO public.parent");
        assert!(last_table < first_data);
        // Parents are loaded before children.
        assert!(first_data < position(&dispatched, "INSERT INTO public.child"));
    }

    #[tokio::test]
    async fn test_file_order_keeps_dump_order() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(
            "INSERT INTO t VALUES (1);\nCREATE TABLE t (id int);\n",
        );
        let options = ImportOptions {
            execution_order: ExecutionOrder::FileOrder,
            dry_run_first: false,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);
        orch.start_import(&parsed).await.unwrap();

        let dispatched = channel.dispatched();
        assert!(position(&dispatched, "INSERT") < position(&dispatched, "CREATE TABLE"));
    }

    #[tokio::test]
    async fn test_batches_never_exceed_batch_size() {
        let channel = Arc::new(FakeChannel::new());
        let mut dump = String::from("CREATE TABLE t (id int);\n");
        for i in 0..25 {
            dump.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let parsed = ParsedSqlFile::parse(&dump);
        let options = ImportOptions {
            batch_size: 10,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.statements_executed, 26);
        assert!(channel.calls().iter().all(|c| c.statements.len() <= 10));
        assert_eq!(channel.executed().len(), 4);
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let channel = Arc::new(FakeChannel::new());
        channel.fail_on("VALUES (3)", "invalid input syntax for type integer: \"x\"");
        let mut dump = String::from("CREATE TABLE t (id int);\n");
        for i in 0..12 {
            dump.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let parsed = ParsedSqlFile::parse(&dump);
        let (tx, mut rx) = mpsc::channel(1024);
        let options = ImportOptions {
            stop_on_first_error: false,
            batch_size: 10,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options).with_events(tx);
        orch.start_import(&parsed).await.unwrap();

        let mut last = 0;
        let mut snapshots = 0;
        while let Ok(event) = rx.try_recv() {
            if let ImportEvent::Progress(p) = event {
                assert!(p.processed() >= last);
                assert!(p.processed() <= p.total_statements);
                last = p.processed();
                snapshots += 1;
            }
        }
        assert!(snapshots > 0);
        assert_eq!(last, 13);
    }

    #[tokio::test]
    async fn test_cancel_stops_dispatching() {
        let channel = Arc::new(FakeChannel::new());
        let mut dump = String::from("CREATE TABLE t (id int);\n");
        for i in 0..25 {
            dump.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let parsed = ParsedSqlFile::parse(&dump);
        let options = ImportOptions {
            batch_size: 10,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);
        let controller = orch.controller();
        channel.on_execute(move |_| {
            let _ = controller.cancel();
        });

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Cancelled);
        assert_eq!(channel.executed().len(), 1);
        assert_eq!(orch.controller().state(), ControlState::Cancelled);
        assert!(summary.logs.iter().any(|l| l.message == "Cancelling import..."));
    }

    #[tokio::test]
    async fn test_pause_and_resume() {
        let channel = Arc::new(FakeChannel::new());
        let mut dump = String::from("CREATE TABLE t (id int);\n");
        for i in 0..15 {
            dump.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let parsed = ParsedSqlFile::parse(&dump);
        let options = ImportOptions {
            batch_size: 10,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);
        let controller = orch.controller();

        let pauser = controller.clone();
        let paused_once = AtomicBool::new(false);
        channel.on_execute(move |_| {
            if !paused_once.swap(true, Ordering::SeqCst) {
                let _ = pauser.pause();
            }
        });

        let handle = tokio::spawn(async move { orch.start_import(&parsed).await });

        let mut state = controller.subscribe();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|s| *s == ControlState::Paused),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(channel.executed().len(), 1);
        assert!(!controller.can_pause());
        assert!(controller.can_resume());

        controller.resume().unwrap();
        let summary = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        assert_eq!(summary.statements_executed, 16);
        let messages: Vec<&str> = summary.logs.iter().map(|l| l.message.as_str()).collect();
        assert!(messages.contains(&"Import paused"));
        assert!(messages.contains(&"Import resumed"));
    }

    #[tokio::test]
    async fn test_integrity_errors_block_start() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse("CREATE TABLE t (id int);\nINSERT INTO t VALUES (1");
        let mut orch = orchestrator(&channel, ImportOptions::default());

        let err = orch.start_import(&parsed).await.unwrap_err();
        assert!(matches!(err, DumpImportError::IntegrityBlocked(_)));
        assert!(channel.calls().is_empty());
        assert_eq!(orch.controller().state(), ControlState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejected_while_running() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(CLEAN);
        let mut orch = orchestrator(&channel, ImportOptions::default());
        orch.controller().start().unwrap();

        let err = orch.start_import(&parsed).await.unwrap_err();
        assert!(matches!(err, DumpImportError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_new_session_after_completion() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(CLEAN);
        let mut orch = orchestrator(&channel, ImportOptions::default());

        let first = orch.start_import(&parsed).await.unwrap();
        let second = orch.start_import(&parsed).await.unwrap();
        assert_eq!(second.status, ImportStatus::Success);
        assert_ne!(first.session_id, second.session_id);
        assert_eq!(channel.dispatched().len(), 6);
    }

    #[tokio::test]
    async fn test_skip_existing_tables() {
        let channel = Arc::new(FakeChannel::new());
        channel.add_table("public", "t");
        let parsed = ParsedSqlFile::parse(CLEAN);
        let options = ImportOptions {
            skip_existing_tables: true,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        assert_eq!(summary.statements_skipped, 1);
        assert_eq!(summary.statements_executed, 2);
        assert!(!channel.dispatched().iter().any(|s| s.starts_with("CREATE TABLE")));
    }

    #[tokio::test]
    async fn test_syntax_error_in_dry_run_aborts() {
        let channel = Arc::new(FakeChannel::new());
        channel.fail_on("INSERT INTO t", "syntax error at or near \"VALUSE\"");
        let parsed = ParsedSqlFile::parse(CLEAN);
        let mut orch = orchestrator(&channel, ImportOptions::default());

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Failed);
        assert_eq!(summary.statements_failed, 1);
        assert!(channel.executed().is_empty());
        assert_eq!(summary.errors[0].category, ErrorCategory::InvalidSyntax);
    }

    #[tokio::test]
    async fn test_transient_failure_retried() {
        let channel = Arc::new(FakeChannel::new());
        channel.fail_times(
            "INSERT INTO t",
            "canceling statement due to statement timeout",
            Some("57014"),
            1,
        );
        let parsed = ParsedSqlFile::parse(CLEAN);
        let options = ImportOptions {
            dry_run_first: false,
            retry_attempts: 2,
            retry_backoff_ms: 1,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        let inserts = channel
            .executed()
            .iter()
            .filter(|b| b.iter().any(|s| s.contains("INSERT")))
            .count();
        assert_eq!(inserts, 2);
    }

    #[tokio::test]
    async fn test_rerun_failed_batches() {
        let channel = Arc::new(FakeChannel::new());
        // One failure for the dry run, one for the real attempt.
        channel.fail_times("INSERT INTO t", "deadlock detected", Some("40P01"), 2);
        let parsed = ParsedSqlFile::parse(CLEAN);
        let options = ImportOptions {
            stop_on_first_error: false,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let first = orch.start_import(&parsed).await.unwrap();
        assert_eq!(first.status, ImportStatus::Partial);

        let merged = orch.rerun_failed_batches().await.unwrap();
        assert_eq!(merged.status, ImportStatus::Success);
        assert_eq!(merged.statements_executed, 3);
        assert_eq!(merged.statements_failed, 0);
        assert_eq!(merged.session_id, first.session_id);
        assert_eq!(merged.errors.len(), 1);

        let err = orch.rerun_failed_batches().await.unwrap_err();
        assert!(matches!(err, DumpImportError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_alignment_runs_before_import_and_rolls_back() {
        let channel = Arc::new(FakeChannel::new());
        channel.add_column("public", "t", "id", "integer", true, None);
        let parsed = ParsedSqlFile::parse(
            "CREATE TABLE public.t (id integer, name text DEFAULT 'x'::text);\n\
             INSERT INTO public.t (id, name) VALUES (1, 'a');\n",
        );
        let options = ImportOptions {
            skip_existing_tables: true,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options).with_alignment(AlignmentConfig::default());

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        assert!(channel.column("public", "t", "name").is_some());

        let dispatched = channel.dispatched();
        assert!(position(&dispatched, "ADD COLUMN") < position(&dispatched, "INSERT INTO"));

        let outcome = orch.rollback_alignment().await.unwrap();
        assert!(outcome.reverted_count >= 1);
        assert!(channel.column("public", "t", "name").is_none());
    }

    #[tokio::test]
    async fn test_rollback_without_alignment() {
        let channel = Arc::new(FakeChannel::new());
        let mut orch = orchestrator(&channel, ImportOptions::default());
        let outcome = orch.rollback_alignment().await.unwrap();
        assert_eq!(outcome.reverted_count, 0);
        assert_eq!(outcome.logs[0].message, "No alignment changes to rollback");
    }

    #[tokio::test]
    async fn test_phase_duration_covers_first_batch() {
        let channel = Arc::new(FakeChannel::new());
        channel.on_execute(|_| std::thread::sleep(Duration::from_millis(80)));
        let parsed = ParsedSqlFile::parse("CREATE TABLE t(id int);\n");
        let options = ImportOptions {
            dry_run_first: false,
            ..ImportOptions::default()
        };
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        let metrics = summary.metrics.unwrap();
        assert!(metrics.phases[&crate::session::ImportPhase::Schema].duration_ms >= 80);
    }

    #[tokio::test]
    async fn test_checkpoint_and_resume() {
        use crate::config::ResumePoint;
        use crate::session::ImportPhase;
        use std::sync::atomic::AtomicUsize;

        let mut dump = String::from("CREATE TABLE t (id int);\n");
        for i in 0..25 {
            dump.push_str(&format!("INSERT INTO t VALUES ({});\n", i));
        }
        let parsed = ParsedSqlFile::parse(&dump);
        let options = ImportOptions {
            batch_size: 10,
            ..ImportOptions::default()
        };

        let channel = Arc::new(FakeChannel::new());
        let (tx, mut rx) = mpsc::channel(1024);
        let mut orch = orchestrator(&channel, options.clone()).with_events(tx);
        let controller = orch.controller();
        let calls = AtomicUsize::new(0);
        channel.on_execute(move |_| {
            if calls.fetch_add(1, Ordering::SeqCst) == 1 {
                let _ = controller.cancel();
            }
        });

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Cancelled);
        let checkpoint = orch.last_checkpoint().cloned().unwrap();
        assert_eq!(checkpoint.phase, ImportPhase::Data);
        assert_eq!(checkpoint.batch, 1);
        assert_eq!(checkpoint.total_batches, 3);
        assert_eq!(checkpoint.statements_executed, 11);
        assert_eq!(checkpoint.session_id, summary.session_id);

        let mut streamed = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let ImportEvent::Checkpoint(c) = event {
                streamed.push((c.phase, c.batch));
            }
        }
        assert_eq!(streamed, vec![(ImportPhase::Schema, 1), (ImportPhase::Data, 1)]);

        let resumed_channel = Arc::new(FakeChannel::new());
        let options = ImportOptions {
            resume_from: Some(checkpoint.resume_point()),
            ..options
        };
        assert_eq!(
            options.resume_from,
            Some(ResumePoint {
                phase: ImportPhase::Data,
                batch_index: 1
            })
        );
        let mut orch = orchestrator(&resumed_channel, options);
        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        assert_eq!(summary.statements_executed, 15);
        assert_eq!(resumed_channel.executed().len(), 2);
        assert!(!resumed_channel.dispatched().iter().any(|s| s.contains("CREATE TABLE")));
        assert!(summary
            .logs
            .iter()
            .any(|l| l.message == "Resuming import from checkpoint"));
        assert_eq!(orch.last_checkpoint().map(|c| c.batch), Some(3));
    }

    #[tokio::test]
    async fn test_drop_rewritten_before_dispatch() {
        let channel = Arc::new(FakeChannel::new());
        let parsed = ParsedSqlFile::parse(
            "DROP TABLE public.t;\nDROP TABLE audit.t;\nCREATE TABLE public.t (id int);\n",
        );
        let mut options = ImportOptions::default();
        options.drop_if_exists.allow_schema_drop = true;
        options.drop_if_exists.cascade = true;
        let mut orch = orchestrator(&channel, options);

        let summary = orch.start_import(&parsed).await.unwrap();
        assert_eq!(summary.status, ImportStatus::Success);
        let dispatched = channel.dispatched();
        assert!(dispatched.contains(&"DROP TABLE IF EXISTS public.t CASCADE;".to_string()));
        assert!(dispatched.contains(&"DROP TABLE audit.t;".to_string()));
        assert!(channel
            .dry_runs()
            .concat()
            .contains(&"DROP TABLE IF EXISTS public.t CASCADE;".to_string()));
        assert!(summary
            .logs
            .iter()
            .any(|l| l.message == "Rewrote 1 DROP statements to DROP ... IF EXISTS"));
    }

    #[test]
    fn test_verify_engine_uses_verify_concurrency() {
        let channel = Arc::new(FakeChannel::new());
        let options = ImportOptions {
            verify_concurrency: 9,
            ..ImportOptions::default()
        };
        assert_eq!(orchestrator(&channel, options).verify_engine().concurrency(), 9);
    }

    #[test]
    fn test_retryable_outcomes() {
        let timeout = ExecuteResult {
            success: false,
            results: vec![crate::channel::StatementOutcome {
                index: 0,
                status: StatementStatus::Failed {
                    statement: "INSERT".into(),
                    error: "canceling statement due to statement timeout".into(),
                    sqlstate: Some("57014".into()),
                },
            }],
            error: Some("canceling statement due to statement timeout".into()),
        };
        assert!(is_retryable(&Ok(timeout.clone())));

        let mut partly_done = timeout;
        partly_done.results.insert(
            0,
            crate::channel::StatementOutcome {
                index: 0,
                status: StatementStatus::Executed,
            },
        );
        assert!(!is_retryable(&Ok(partly_done)));
        assert!(!is_retryable(&Ok(ExecuteResult::failed("syntax error at or near \"x\""))));
    }
}
