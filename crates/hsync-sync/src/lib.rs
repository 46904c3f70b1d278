//! Sync orchestration for the unified health ledger: configuration, the
//! merge/dedup engine, ledger sinks and run reports.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use hsync_core::Source;
use hsync_storage::{FileCredentialStore, HttpFetcher};
use tracing::info;

pub mod config;
pub mod ledger;
pub mod merge;
pub mod orchestrator;
pub mod report;

pub use config::{LedgerTarget, SourceRegistry, SyncConfig};
pub use ledger::{LedgerSink, MemoryLedger, ParquetLedger, PostgresLedger};
pub use merge::{apply_plan, decide, plan_merge, LedgerOp, MergeCounts, MergeDecision, MergePlan, SinkWriteError, WriteMode};
pub use orchestrator::{parse_since, SinceError, SyncMode, SyncPipeline, SyncRequest};
pub use report::{Phase, RunOutcome, SourceOutcome, SourceReport, SyncReport};

pub const CRATE_NAME: &str = "hsync-sync";

pub async fn open_ledger(target: &LedgerTarget) -> Result<Arc<dyn LedgerSink>> {
    Ok(match target {
        LedgerTarget::Parquet(path) => Arc::new(ParquetLedger::new(path.clone())),
        LedgerTarget::Postgres(url) => Arc::new(PostgresLedger::connect(url).await?),
    })
}

/// Registry with environment overrides applied.
pub async fn load_registry(config: &SyncConfig) -> Result<SourceRegistry> {
    let mut registry = SourceRegistry::load(&config.registry_path).await?;
    registry.apply_env(&config.env);
    Ok(registry)
}

/// Pipeline wired from `HSYNC_*` configuration: file credential store,
/// shared HTTP client and the configured ledger.
pub async fn pipeline_from_config(config: &SyncConfig) -> Result<SyncPipeline> {
    let registry = load_registry(config).await?;
    let http = Arc::new(HttpFetcher::new(config.http_config(&registry)).context("building http client")?);
    let credentials = Arc::new(FileCredentialStore::with_env(config.state_dir.clone(), config.env.clone()));
    let sink = open_ledger(&config.ledger).await?;
    Ok(SyncPipeline::new(registry, credentials, http, sink)
        .with_tz(config.tz)
        .with_workers(config.workers))
}

/// Runs one sync and writes its report. The report directory is returned
/// alongside the report.
pub async fn run_sync_from_env(request: &SyncRequest) -> Result<(SyncReport, PathBuf)> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config).await?;
    let report = pipeline.run(request).await;
    let dir = report.write(&config.reports_dir).await?;
    info!(run_id = %report.run_id, dir = %dir.display(), "run report written");
    Ok((report, dir))
}

#[derive(Debug)]
pub struct ConnectivityCheck {
    pub ledger: Result<(), String>,
    pub sources: Vec<(Source, Result<(), String>)>,
}

impl ConnectivityCheck {
    pub fn all_ok(&self) -> bool {
        self.ledger.is_ok() && self.sources.iter().all(|(_, r)| r.is_ok())
    }
}

/// Probes the ledger (write round trip) and every selected source.
pub async fn verify_connectivity(pipeline: &SyncPipeline, sources: &[Source]) -> ConnectivityCheck {
    let ledger = pipeline
        .sink()
        .verify_write_access()
        .await
        .map_err(|err| format!("{err:#}"));
    let sources = pipeline
        .verify_sources(sources)
        .await
        .into_iter()
        .map(|(source, result)| (source, result.map_err(|err| err.to_string())))
        .collect();
    ConnectivityCheck { ledger, sources }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn parquet_target_opens_without_touching_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.parquet");
        let sink = open_ledger(&LedgerTarget::Parquet(path.clone())).await.unwrap();
        assert!(sink.describe().contains("ledger.parquet"));
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn registry_picks_up_environment_overrides() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([
            ("HSYNC_ROOT".to_string(), dir.path().display().to_string()),
            ("OURA_BASE_URL".to_string(), "http://127.0.0.1:9".to_string()),
        ]);
        let config = SyncConfig::from_vars(env).unwrap();
        let registry = load_registry(&config).await.unwrap();
        assert_eq!(registry.settings(Source::Oura).base_url.as_deref(), Some("http://127.0.0.1:9"));
        assert_eq!(registry.enabled_sources().len(), 6);
    }

    #[tokio::test]
    async fn connectivity_reports_ledger_and_sources_separately() {
        let dir = tempfile::tempdir().unwrap();
        let env = HashMap::from([("HSYNC_ROOT".to_string(), dir.path().display().to_string())]);
        let config = SyncConfig::from_vars(env).unwrap();
        let pipeline = pipeline_from_config(&config).await.unwrap();

        let check = verify_connectivity(&pipeline, &[Source::Oura]).await;
        assert!(check.ledger.is_ok(), "{:?}", check.ledger);
        assert!(check.sources[0].1.as_ref().unwrap_err().contains("OURA_ACCESS_TOKEN"));
        assert!(!check.all_ok());
    }
}
