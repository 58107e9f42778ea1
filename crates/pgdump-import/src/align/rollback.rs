//! Reverse the alignment audit.

use std::collections::BTreeMap;

use serde::Serialize;

use super::{AlignmentAction, AlignmentChange, SchemaAligner, TargetColumn};
use crate::channel::ExecuteOptions;
use crate::error::{DumpImportError, Result};
use crate::session::{ImportLog, Journal, LogLevel};

/// What a rollback did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RollbackOutcome {
    /// Inverse statements executed.
    pub reverted_count: usize,
    /// Inverse statements skipped because the target already matched.
    pub skipped_count: usize,
    pub logs: Vec<ImportLog>,
}

impl RollbackOutcome {
    pub fn nothing_to_do() -> Self {
        let mut journal = Journal::new();
        journal.info("No alignment changes to rollback");
        let (logs, _) = journal.into_parts();
        Self {
            logs,
            ..Self::default()
        }
    }
}

impl SchemaAligner {
    /// Undo every audited change, newest first, in one transaction.
    ///
    /// Inverses whose effect is already present on the target are skipped,
    /// so a second rollback (or one after a manual fix) is harmless. The
    /// audit is cleared only when the transaction commits.
    pub async fn rollback(&mut self) -> Result<RollbackOutcome> {
        if self.audit.iter().all(|c| c.rollback.is_none()) {
            self.audit.clear();
            return Ok(RollbackOutcome::nothing_to_do());
        }

        let snapshot = self
            .introspect()
            .await
            .map_err(|e| DumpImportError::Rollback(e.to_string()))?;

        let mut plan = Vec::new();
        let mut skipped = 0;
        for change in self.audit.iter().rev() {
            let Some(statement) = &change.rollback else {
                continue;
            };
            if still_applied(change, &snapshot) {
                plan.push(statement.clone());
            } else {
                skipped += 1;
            }
        }

        let mut journal = Journal::new();
        journal.log(
            LogLevel::Warn,
            "Starting rollback of schema alignment",
            Some(format!("{} statements", plan.len())),
        );
        journal.log(LogLevel::Info, "Rollback plan", Some(plan.join("\n")));

        if !plan.is_empty() {
            let options = ExecuteOptions {
                transactional: true,
                stop_on_error: true,
                ..ExecuteOptions::default()
            };
            let failure = match self
                .channel
                .execute(&self.connection, &plan, &options)
                .await
            {
                Ok(result) if result.success => None,
                Ok(result) => Some(
                    result
                        .error
                        .unwrap_or_else(|| "rollback transaction failed".to_string()),
                ),
                Err(e) => Some(e.to_string()),
            };
            if let Some(message) = failure {
                journal.log(LogLevel::Error, "Rollback failed", Some(message.clone()));
                return Err(DumpImportError::Rollback(message));
            }
        }

        self.audit.clear();
        self.added.clear();
        journal.success("Rollback completed");
        let (logs, _) = journal.into_parts();
        Ok(RollbackOutcome {
            reverted_count: plan.len(),
            skipped_count: skipped,
            logs,
        })
    }
}

/// Whether the target still shows the effect of `change`.
fn still_applied(change: &AlignmentChange, snapshot: &BTreeMap<String, Vec<TargetColumn>>) -> bool {
    let column = snapshot
        .get(&change.table.qualified())
        .and_then(|cols| cols.iter().find(|c| c.name == change.column));
    match (change.action, column) {
        (_, None) => false,
        (AlignmentAction::AddColumn, Some(_)) => true,
        (AlignmentAction::DropNotNull, Some(col)) => col.nullable,
        (AlignmentAction::SetNotNull, Some(col)) => !col.nullable,
        (AlignmentAction::Backfill, Some(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::config::{AlignmentConfig, ConnectionConfig};
    use crate::parser::{implied_schema, ParsedSqlFile};
    use crate::testing::FakeChannel;

    const DUMP: &str = "CREATE TABLE public.t (\n    id integer NOT NULL,\n    name text DEFAULT 'x'::text\n);\n";

    async fn aligned() -> (Arc<FakeChannel>, SchemaAligner) {
        let channel = FakeChannel::new();
        channel.add_column("public", "t", "id", "integer", false, None);
        channel.add_column("public", "t", "legacy", "text", false, None);
        let channel = Arc::new(channel);
        let mut aligner = SchemaAligner::new(
            channel.clone(),
            ConnectionConfig::new("localhost", "db", "user", "pw"),
            AlignmentConfig::default(),
        );
        let dump = implied_schema(&ParsedSqlFile::parse(DUMP));
        let mut journal = Journal::new();
        aligner.stage_one(&dump, &mut journal).await.unwrap();
        aligner.stage_two(&mut journal).await.unwrap();
        (channel, aligner)
    }

    #[tokio::test]
    async fn test_rollback_restores_original_catalog() {
        let (channel, mut aligner) = aligned().await;
        assert!(channel.column("public", "t", "name").is_some());
        assert!(channel.column("public", "t", "legacy").unwrap().nullable);

        let outcome = aligner.rollback().await.unwrap();
        // SET NOT NULL on name, ADD COLUMN name, DROP NOT NULL on legacy.
        assert_eq!(outcome.reverted_count, 3);
        assert_eq!(outcome.skipped_count, 0);
        assert!(aligner.audit().is_empty());

        assert!(channel.column("public", "t", "name").is_none());
        assert!(!channel.column("public", "t", "legacy").unwrap().nullable);

        let messages: Vec<&str> = outcome.logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(
            messages,
            vec![
                "Starting rollback of schema alignment",
                "Rollback plan",
                "Rollback completed"
            ]
        );
        let plan = outcome.logs[1].details.as_deref().unwrap();
        assert!(plan.starts_with("ALTER TABLE \"public\".\"t\" ALTER COLUMN \"name\" DROP NOT NULL;"));
    }

    #[tokio::test]
    async fn test_second_rollback_is_noop() {
        let (_channel, mut aligner) = aligned().await;
        aligner.rollback().await.unwrap();
        let outcome = aligner.rollback().await.unwrap();
        assert_eq!(outcome.reverted_count, 0);
        assert_eq!(outcome.logs[0].message, "No alignment changes to rollback");
    }

    #[tokio::test]
    async fn test_rollback_skips_already_reverted() {
        let (channel, mut aligner) = aligned().await;
        channel.drop_column("public", "t", "name");

        let outcome = aligner.rollback().await.unwrap();
        assert_eq!(outcome.reverted_count, 1);
        assert_eq!(outcome.skipped_count, 2);
        assert!(!channel.column("public", "t", "legacy").unwrap().nullable);
    }

    #[tokio::test]
    async fn test_failed_rollback_keeps_audit() {
        let (channel, mut aligner) = aligned().await;
        channel.fail_on("DROP COLUMN", "cannot drop column name because other objects depend on it");

        let err = aligner.rollback().await.unwrap_err();
        assert!(matches!(err, DumpImportError::Rollback(_)));
        assert_eq!(aligner.audit().len(), 4);
        assert!(channel.column("public", "t", "name").is_some());
    }
}
