use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use hsync_adapters::{AdapterError, DateWindow, NormalizationError};
use hsync_core::Source;
use hsync_storage::write_atomic;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::merge::{MergeCounts, SinkWriteError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Resolving,
    Fetching,
    Normalizing,
    Merging,
    Done,
    PartiallyFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseChange {
    pub phase: Phase,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SourceOutcome {
    Succeeded {
        payloads: usize,
        records: usize,
        sub_windows: usize,
    },
    Failed {
        error_kind: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceReport {
    pub source: Source,
    pub outcome: SourceOutcome,
    /// Payloads that could not be mapped, one entry per payload.
    #[serde(default)]
    pub skipped: Vec<NormalizationError>,
    #[serde(default)]
    pub credentials_refreshed: bool,
    /// Renewed credentials that could not be stored.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential_warning: Option<String>,
}

impl SourceReport {
    pub fn failed(source: Source, err: &AdapterError) -> Self {
        Self {
            source,
            outcome: SourceOutcome::Failed {
                error_kind: err.kind().to_string(),
                message: err.to_string(),
            },
            skipped: Vec::new(),
            credentials_refreshed: false,
            credential_warning: None,
        }
    }

    pub fn succeeded(&self) -> bool {
        matches!(self.outcome, SourceOutcome::Succeeded { .. })
    }
}

/// Worst result of a run, mapped to the process exit status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Partial,
    Failed,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        match self {
            RunOutcome::Success => 0,
            RunOutcome::Partial => 2,
            RunOutcome::Failed => 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Partial => "partial",
            RunOutcome::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: Uuid,
    pub mode: String,
    pub window: Option<DateWindow>,
    pub timezone: String,
    pub ledger: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub phases: Vec<PhaseChange>,
    pub sources: Vec<SourceReport>,
    pub merge: Option<MergeCounts>,
    /// Duplicate identities within the batch, dropped before merging.
    pub collapsed: usize,
    pub sink_failure: Option<SinkWriteError>,
    /// Run-level failure that stopped the run before or during merge.
    pub failure: Option<String>,
}

impl SyncReport {
    pub fn start(mode: impl Into<String>, timezone: impl Into<String>, ledger: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            mode: mode.into(),
            window: None,
            timezone: timezone.into(),
            ledger: ledger.into(),
            started_at: Utc::now(),
            finished_at: None,
            phases: Vec::new(),
            sources: Vec::new(),
            merge: None,
            collapsed: 0,
            sink_failure: None,
            failure: None,
        }
    }

    pub fn enter(&mut self, phase: Phase) {
        info!(run_id = %self.run_id, phase = ?phase, "run phase");
        self.phases.push(PhaseChange { phase, at: Utc::now() });
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phases.last().map(|p| p.phase)
    }

    /// Marks the run failed and closes it.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.failure = Some(reason.into());
        self.finish();
    }

    /// Closes the run with `Done`, `PartiallyFailed` or `Failed`.
    pub fn finish(&mut self) {
        let last = match self.outcome() {
            RunOutcome::Success => Phase::Done,
            RunOutcome::Partial => Phase::PartiallyFailed,
            RunOutcome::Failed => Phase::Failed,
        };
        self.enter(last);
        self.finished_at = Some(Utc::now());
    }

    pub fn outcome(&self) -> RunOutcome {
        if self.failure.is_some() || self.sink_failure.is_some() {
            return RunOutcome::Failed;
        }
        let failed = self.failed_sources().len();
        if failed == 0 {
            RunOutcome::Success
        } else if failed < self.sources.len() {
            RunOutcome::Partial
        } else {
            RunOutcome::Failed
        }
    }

    pub fn failed_sources(&self) -> Vec<Source> {
        self.sources.iter().filter(|s| !s.succeeded()).map(|s| s.source).collect()
    }

    pub fn succeeded_sources(&self) -> Vec<Source> {
        self.sources.iter().filter(|s| s.succeeded()).map(|s| s.source).collect()
    }

    pub fn skipped_records(&self) -> usize {
        self.sources.iter().map(|s| s.skipped.len()).sum()
    }

    pub fn to_markdown(&self) -> String {
        let outcome = self.outcome();
        let window = self
            .window
            .map(|w| format!("{}..{}", w.start, w.end))
            .unwrap_or_else(|| "unresolved".to_string());
        let mut lines = vec![
            format!("# health-sync run `{}`", self.run_id),
            String::new(),
            format!("- Mode: {} {window}", self.mode),
            format!("- Outcome: {} (exit {})", outcome.as_str(), outcome.exit_code()),
            format!("- Timezone: {}", self.timezone),
            format!("- Ledger: {}", self.ledger),
            format!("- Started: {}", self.started_at),
        ];
        if let Some(finished) = self.finished_at {
            lines.push(format!("- Finished: {finished}"));
        }
        if let Some(failure) = &self.failure {
            lines.push(format!("- Failure: {failure}"));
        }

        lines.push(String::new());
        lines.push("## Sources".to_string());
        lines.push(String::new());
        lines.push("| source | status | records | skipped | detail |".to_string());
        lines.push("|---|---|---|---|---|".to_string());
        for s in &self.sources {
            let (status, records, detail) = match &s.outcome {
                SourceOutcome::Succeeded { records, payloads, sub_windows } => (
                    "ok".to_string(),
                    records.to_string(),
                    format!("{payloads} payloads in {sub_windows} window(s)"),
                ),
                SourceOutcome::Failed { error_kind, message } => (error_kind.clone(), "-".to_string(), message.clone()),
            };
            lines.push(format!("| {} | {status} | {records} | {} | {detail} |", s.source, s.skipped.len()));
        }

        if let Some(merge) = &self.merge {
            lines.push(String::new());
            lines.push("## Merge".to_string());
            lines.push(format!("- inserted: {}", merge.inserted));
            lines.push(format!("- updated: {}", merge.updated));
            lines.push(format!("- skipped (unchanged): {}", merge.skipped));
            lines.push(format!("- collapsed duplicates: {}", self.collapsed));
        }

        if let Some(sink) = &self.sink_failure {
            lines.push(String::new());
            lines.push("## Ledger write failure".to_string());
            lines.push(format!("- reason: {}", sink.reason));
            lines.push(format!("- written: {}", sink.written));
            lines.push(format!("- not written ({}):", sink.unwritten.len()));
            for op in &sink.unwritten {
                lines.push(format!("  - {}", op.identity()));
            }
        }

        let skipped: Vec<_> = self.sources.iter().flat_map(|s| s.skipped.iter()).collect();
        if !skipped.is_empty() {
            lines.push(String::new());
            lines.push("## Skipped payloads".to_string());
            for err in skipped {
                lines.push(format!("- {err}"));
            }
        }

        let warnings: Vec<_> = self
            .sources
            .iter()
            .filter_map(|s| s.credential_warning.as_ref().map(|w| (s.source, w)))
            .collect();
        if !warnings.is_empty() {
            lines.push(String::new());
            lines.push("## Credential warnings".to_string());
            for (source, warning) in warnings {
                lines.push(format!("- {source}: {warning}"));
            }
        }

        lines.push(String::new());
        lines.join("\n")
    }

    /// Writes `run_report.json` and `summary.md` under `<reports_dir>/<run_id>/`.
    pub async fn write(&self, reports_dir: &Path) -> Result<PathBuf> {
        let dir = reports_dir.join(self.run_id.to_string());
        let json = serde_json::to_vec_pretty(self).context("serializing run report")?;
        write_atomic(&dir.join("run_report.json"), &json)
            .await
            .context("writing run_report.json")?;
        write_atomic(&dir.join("summary.md"), self.to_markdown().as_bytes())
            .await
            .context("writing summary.md")?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::merge::LedgerOp;
    use chrono::NaiveDate;
    use hsync_core::UnifiedRecord;

    fn ok(source: Source) -> SourceReport {
        SourceReport {
            source,
            outcome: SourceOutcome::Succeeded {
                payloads: 2,
                records: 2,
                sub_windows: 1,
            },
            skipped: Vec::new(),
            credentials_refreshed: false,
            credential_warning: None,
        }
    }

    #[test]
    fn outcome_reflects_the_worst_result() {
        let mut report = SyncReport::start("fetch", "UTC", "memory");
        report.sources = vec![ok(Source::Oura), ok(Source::Garmin)];
        assert_eq!(report.outcome(), RunOutcome::Success);

        report.sources.push(SourceReport::failed(
            Source::Ultrahuman,
            &AdapterError::SourceUnavailable(Source::Ultrahuman, "503".into()),
        ));
        assert_eq!(report.outcome(), RunOutcome::Partial);
        assert_eq!(report.outcome().exit_code(), 2);
        assert_eq!(report.failed_sources(), vec![Source::Ultrahuman]);

        report.sink_failure = Some(SinkWriteError::nothing_written("disk full", &[]));
        assert_eq!(report.outcome(), RunOutcome::Failed);
        assert_eq!(report.outcome().exit_code(), 1);
    }

    #[test]
    fn finishing_records_the_terminal_phase() {
        let mut report = SyncReport::start("fetch", "UTC", "memory");
        report.enter(Phase::Resolving);
        report.fail("window start is after end");
        assert_eq!(report.phase(), Some(Phase::Failed));
        assert!(report.finished_at.is_some());
    }

    #[test]
    fn summary_lists_failures_and_unwritten_rows() {
        let mut report = SyncReport::start("backfill", "UTC", "memory");
        report.window = Some(DateWindow::single(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap()));
        report.sources = vec![SourceReport::failed(
            Source::Garmin,
            &AdapterError::LoginRequired(Source::Garmin, "no stored browser session".into()),
        )];
        let record = UnifiedRecord::new(NaiveDate::from_ymd_opt(2025, 1, 2).unwrap(), Source::Oura, "A-100");
        report.sink_failure = Some(SinkWriteError::nothing_written("timeout", &[LedgerOp::Insert(record)]));

        let md = report.to_markdown();
        assert!(md.contains("- Mode: backfill 2025-01-02..2025-01-02"));
        assert!(md.contains("| garmin | login_required | - | 0 |"));
        assert!(md.contains("  - 2025-01-02|oura|A-100"));
        assert!(md.contains("exit 1"));
    }

    #[tokio::test]
    async fn report_files_land_under_the_run_id() {
        let dir = tempfile::tempdir().unwrap();
        let mut report = SyncReport::start("fetch", "UTC", "memory");
        report.sources = vec![ok(Source::Oura)];
        report.finish();

        let run_dir = report.write(dir.path()).await.unwrap();
        assert!(run_dir.ends_with(report.run_id.to_string()));
        let json: SyncReport =
            serde_json::from_slice(&std::fs::read(run_dir.join("run_report.json")).unwrap()).unwrap();
        assert_eq!(json, report);
        assert!(std::fs::read_to_string(run_dir.join("summary.md")).unwrap().contains("| oura | ok | 2 | 0 |"));
    }
}
