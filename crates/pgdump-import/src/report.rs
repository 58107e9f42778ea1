//! JSON export of a finished import session.
//!
//! The document layout is consumed by operator tooling, so key names and
//! value formats are fixed: camelCase keys, ISO-8601 UTC timestamps with
//! millisecond precision, a human duration and a percentage success rate.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::Result;
use crate::session::{ImportStatus, ImportSummary, LogLevel, PhaseStats};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportSummary {
    pub status: ImportStatus,
    pub start_time: String,
    pub end_time: String,
    /// `"Xm Ys"`, or `"Ys"` under a minute.
    pub duration: String,
    pub statements_executed: usize,
    pub statements_failed: usize,
    /// One decimal followed by `%`, e.g. `"97.5%"`.
    pub success_rate: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportError {
    pub phase: String,
    pub statement: String,
    pub error: String,
    pub timestamp: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLog {
    pub level: LogLevel,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
    pub timestamp: String,
}

/// Self-describing report of one import session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    pub summary: ReportSummary,
    /// Keyed by phase name (`schema`, `data`, ...).
    pub phases: BTreeMap<String, PhaseStats>,
    pub errors: Vec<ReportError>,
    pub logs: Vec<ReportLog>,
}

impl ImportReport {
    pub fn from_summary(summary: &ImportSummary) -> Self {
        Self {
            summary: ReportSummary {
                status: summary.status,
                start_time: timestamp(&summary.start_time),
                end_time: timestamp(&summary.end_time),
                duration: format_duration(summary.duration_ms),
                statements_executed: summary.statements_executed,
                statements_failed: summary.statements_failed,
                success_rate: format!("{:.1}%", summary.success_rate()),
            },
            phases: summary
                .phases
                .iter()
                .map(|(phase, stats)| (phase.as_str().to_string(), *stats))
                .collect(),
            errors: summary
                .errors
                .iter()
                .map(|e| ReportError {
                    phase: e.phase.as_str().to_string(),
                    statement: e.statement.clone(),
                    error: e.error.clone(),
                    timestamp: timestamp(&e.timestamp),
                })
                .collect(),
            logs: summary
                .logs
                .iter()
                .map(|l| ReportLog {
                    level: l.level,
                    message: l.message.clone(),
                    details: l.details.clone(),
                    timestamp: timestamp(&l.timestamp),
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Write the report as pretty-printed JSON.
    pub fn write_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_json()?)?;
        info!("Import report written to {}", path.display());
        Ok(())
    }

    /// Default file name, e.g. `pg-import-report-2024-05-01T10-00-00.000Z.json`.
    pub fn file_name(&self) -> String {
        format!(
            "pg-import-report-{}.json",
            self.summary.start_time.replace(':', "-")
        )
    }
}

/// Serialize a finished session to report JSON.
pub fn export_report(summary: &ImportSummary) -> Result<String> {
    ImportReport::from_summary(summary).to_json()
}

/// Whole seconds as `"Xm Ys"`, or `"Ys"` under one minute.
pub fn format_duration(duration_ms: u64) -> String {
    let seconds = duration_ms / 1000;
    if seconds >= 60 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}s", seconds)
    }
}

fn timestamp(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;
    use crate::classifier::classify_error;
    use crate::session::{ImportError, ImportLog, ImportPhase};

    fn summary() -> ImportSummary {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 10, 0, 0).unwrap();
        let mut phases = BTreeMap::new();
        phases.insert(ImportPhase::Schema, PhaseStats { executed: 1, failed: 0 });
        phases.insert(ImportPhase::Data, PhaseStats { executed: 1, failed: 1 });
        let mut error = ImportError::new(
            1,
            "INSERT INTO t VALUES (1);",
            "duplicate key value violates unique constraint \"t_pkey\"",
            ImportPhase::Data,
            classify_error("duplicate key value violates unique constraint \"t_pkey\""),
        );
        error.timestamp = start;

        ImportSummary {
            session_id: "s-1".into(),
            status: ImportStatus::Partial,
            start_time: start,
            end_time: start + chrono::Duration::milliseconds(83_400),
            duration_ms: 83_400,
            statements_executed: 2,
            statements_failed: 1,
            statements_skipped: 0,
            total_statements: 3,
            errors: vec![error],
            logs: vec![ImportLog {
                timestamp: start,
                level: LogLevel::Warn,
                message: "Import completed with errors".into(),
                details: None,
            }],
            phases,
            metrics: None,
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0s");
        assert_eq!(format_duration(59_999), "59s");
        assert_eq!(format_duration(83_400), "1m 23s");
        assert_eq!(format_duration(3_600_000), "60m 0s");
    }

    #[test]
    fn test_report_shape() {
        let json: serde_json::Value =
            serde_json::from_str(&export_report(&summary()).unwrap()).unwrap();

        let s = &json["summary"];
        assert_eq!(s["status"], "partial");
        assert_eq!(s["startTime"], "2024-05-01T10:00:00.000Z");
        assert_eq!(s["endTime"], "2024-05-01T10:01:23.400Z");
        assert_eq!(s["duration"], "1m 23s");
        assert_eq!(s["statementsExecuted"], 2);
        assert_eq!(s["statementsFailed"], 1);
        assert_eq!(s["successRate"], "66.7%");

        assert_eq!(json["phases"]["data"]["failed"], 1);
        assert_eq!(json["errors"][0]["phase"], "data");
        assert_eq!(json["errors"][0]["timestamp"], "2024-05-01T10:00:00.000Z");
        assert_eq!(json["logs"][0]["level"], "warn");
        assert!(json["logs"][0].get("details").is_none());
    }

    #[test]
    fn test_write_report() {
        let dir = tempfile::tempdir().unwrap();
        let report = ImportReport::from_summary(&summary());
        let path = dir.path().join(report.file_name());
        report.write_to(&path).unwrap();

        let back: ImportReport =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(back, report);
        assert_eq!(report.file_name(), "pg-import-report-2024-05-01T10-00-00.000Z.json");
    }
}
