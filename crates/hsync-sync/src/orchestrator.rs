//! One sync run: resolve the window, fetch and normalize every selected
//! source concurrently, then merge whatever succeeded into the ledger.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use hsync_adapters::{
    build_adapter, normalize_payloads, normalizer_for, AdapterError, DateWindow, InvertedWindow, NormalizationError,
    NormalizeContext,
};
use hsync_core::{OAuthTokens, ReportingTz, SessionState, Source, UnifiedRecord};
use hsync_storage::{CredentialError, CredentialStore, HttpFetcher};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SourceRegistry;
use crate::ledger::LedgerSink;
use crate::merge::{apply_plan, plan_merge};
use crate::report::{Phase, SourceOutcome, SourceReport, SyncReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// The last `since_days` days plus today.
    Fetch { since_days: u32 },
    Backfill { start: NaiveDate, end: NaiveDate },
}

impl SyncMode {
    pub fn label(&self) -> &'static str {
        match self {
            SyncMode::Fetch { .. } => "fetch",
            SyncMode::Backfill { .. } => "backfill",
        }
    }

    pub fn resolve(&self, today: NaiveDate) -> Result<DateWindow, InvertedWindow> {
        match *self {
            SyncMode::Fetch { since_days } => Ok(DateWindow::since(since_days, today)),
            SyncMode::Backfill { start, end } => DateWindow::new(start, end),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRequest {
    pub mode: SyncMode,
    /// Empty means every source enabled in the registry.
    pub sources: Vec<Source>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SinceError {
    #[error("`{0}` is neither `<N>d` nor an ISO date")]
    Unparseable(String),
    #[error("{0} is in the future")]
    Future(NaiveDate),
}

/// `--since` accepts `7d` or `2025-01-01`; both become a day count ending today.
pub fn parse_since(text: &str, today: NaiveDate) -> Result<u32, SinceError> {
    let text = text.trim();
    if let Some(days) = text.strip_suffix('d').or_else(|| text.strip_suffix('D')) {
        return days.trim().parse().map_err(|_| SinceError::Unparseable(text.to_string()));
    }
    let date = NaiveDate::parse_from_str(text, "%Y-%m-%d").map_err(|_| SinceError::Unparseable(text.to_string()))?;
    if date > today {
        return Err(SinceError::Future(date));
    }
    u32::try_from((today - date).num_days()).map_err(|_| SinceError::Unparseable(text.to_string()))
}

struct SourceContext {
    registry: SourceRegistry,
    credentials: Arc<dyn CredentialStore>,
    http: Arc<HttpFetcher>,
    tz: ReportingTz,
}

struct SourceRun {
    report: SourceReport,
    records: Vec<UnifiedRecord>,
}

impl SourceRun {
    fn failed(source: Source, err: AdapterError) -> Self {
        warn!(%source, kind = err.kind(), error = %err, "source failed");
        Self {
            report: SourceReport::failed(source, &err),
            records: Vec::new(),
        }
    }
}

/// Credentials renewed during a source's fetches, kept until the source ends.
#[derive(Default)]
struct Renewed {
    tokens: Option<OAuthTokens>,
    session: Option<SessionState>,
}

impl Renewed {
    fn keep(&mut self, tokens: Option<&OAuthTokens>, session: Option<&SessionState>) {
        if let Some(tokens) = tokens {
            self.tokens = Some(tokens.clone());
        }
        if let Some(session) = session {
            self.session = Some(session.clone());
        }
    }

    fn is_empty(&self) -> bool {
        self.tokens.is_none() && self.session.is_none()
    }

    async fn persist(&self, store: &dyn CredentialStore, source: Source) -> Result<(), CredentialError> {
        if let Some(tokens) = &self.tokens {
            store.put_tokens(source, tokens).await?;
        }
        if let Some(session) = &self.session {
            store.put_session_state(source, session).await?;
        }
        Ok(())
    }
}

async fn sync_source(ctx: Arc<SourceContext>, source: Source, window: DateWindow) -> SourceRun {
    let span = info_span!("sync_source", %source, start = %window.start, end = %window.end);
    run_source(&ctx, source, window).instrument(span).await
}

async fn run_source(ctx: &SourceContext, source: Source, window: DateWindow) -> SourceRun {
    let settings = ctx.registry.settings(source);
    let secret = match ctx.credentials.get_secret(source).await {
        Ok(secret) => Some(secret),
        Err(CredentialError::Missing(_)) => None,
        Err(err) => return SourceRun::failed(source, AdapterError::MissingCredential(source, err.to_string())),
    };
    let mut adapter = match build_adapter(source, secret, &settings, ctx.http.clone()) {
        Ok(adapter) => adapter,
        Err(err) => return SourceRun::failed(source, err),
    };

    let normalizer = normalizer_for(source);
    let norm_ctx = NormalizeContext::new(ctx.tz);
    let sub_windows = window.split(settings.window_days(source));
    let mut renewed = Renewed::default();
    let mut records = Vec::new();
    let mut skipped: Vec<NormalizationError> = Vec::new();
    let mut payloads = 0;
    let mut failure = None;

    for sub in &sub_windows {
        match adapter.fetch(sub).await {
            Ok(output) => {
                adapter.absorb(&output);
                renewed.keep(output.refreshed_tokens.as_ref(), output.refreshed_session.as_ref());
                let (mut mapped, mut errors) = normalize_payloads(normalizer.as_ref(), &output.payloads, &norm_ctx);
                payloads += output.payloads.len();
                records.append(&mut mapped);
                skipped.append(&mut errors);
            }
            Err(failed) => {
                renewed.keep(failed.refreshed_tokens.as_ref(), failed.refreshed_session.as_ref());
                failure = Some(failed.error);
                break;
            }
        }
    }

    // Renewed credentials are kept even when the fetch that renewed them failed.
    let credential_warning = match renewed.persist(ctx.credentials.as_ref(), source).await {
        Ok(()) => None,
        Err(err) => {
            warn!(%source, error = %err, "renewed credentials were not stored");
            Some(err.to_string())
        }
    };

    if let Some(err) = failure {
        let mut run = SourceRun::failed(source, err);
        run.report.credentials_refreshed = !renewed.is_empty();
        run.report.credential_warning = credential_warning;
        return run;
    }

    info!(%source, payloads, records = records.len(), skipped = skipped.len(), "source synced");
    SourceRun {
        report: SourceReport {
            source,
            outcome: SourceOutcome::Succeeded {
                payloads,
                records: records.len(),
                sub_windows: sub_windows.len(),
            },
            skipped,
            credentials_refreshed: !renewed.is_empty(),
            credential_warning,
        },
        records,
    }
}

/// Smallest window covering `window` and every record date. Workouts can
/// land one day outside the request after local-date conversion.
fn identity_span(window: DateWindow, records: &[UnifiedRecord]) -> DateWindow {
    records.iter().fold(window, |span, record| DateWindow {
        start: span.start.min(record.date),
        end: span.end.max(record.date),
    })
}

pub struct SyncPipeline {
    registry: SourceRegistry,
    credentials: Arc<dyn CredentialStore>,
    http: Arc<HttpFetcher>,
    sink: Arc<dyn LedgerSink>,
    tz: ReportingTz,
    workers: usize,
    today: Option<NaiveDate>,
}

impl SyncPipeline {
    pub fn new(
        registry: SourceRegistry,
        credentials: Arc<dyn CredentialStore>,
        http: Arc<HttpFetcher>,
        sink: Arc<dyn LedgerSink>,
    ) -> Self {
        Self {
            registry,
            credentials,
            http,
            sink,
            tz: ReportingTz::default(),
            workers: 4,
            today: None,
        }
    }

    pub fn with_tz(mut self, tz: ReportingTz) -> Self {
        self.tz = tz;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Pins "today" instead of reading the clock in the reporting timezone.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = Some(today);
        self
    }

    pub fn sink(&self) -> &Arc<dyn LedgerSink> {
        &self.sink
    }

    fn today(&self) -> NaiveDate {
        self.today.unwrap_or_else(|| self.tz.today())
    }

    /// Explicitly requested sources run even when the registry disables them.
    pub fn selected_sources(&self, request: &SyncRequest) -> Vec<Source> {
        let mut sources = if request.sources.is_empty() {
            self.registry.enabled_sources()
        } else {
            request.sources.clone()
        };
        sources.sort();
        sources.dedup();
        sources
    }

    /// Runs to completion and returns the report. Failures are recorded in the
    /// report rather than returned; see [`SyncReport::outcome`].
    pub async fn run(&self, request: &SyncRequest) -> SyncReport {
        let mut report = SyncReport::start(request.mode.label(), self.tz.name(), self.sink.describe());
        report.enter(Phase::Resolving);

        let window = match request.mode.resolve(self.today()) {
            Ok(window) => window,
            Err(err) => {
                report.fail(err.to_string());
                return report;
            }
        };
        report.window = Some(window);
        let sources = self.selected_sources(request);
        if sources.is_empty() {
            report.fail("no sources selected");
            return report;
        }
        info!(run_id = %report.run_id, start = %window.start, end = %window.end, sources = sources.len(), "sync run started");

        report.enter(Phase::Fetching);
        let mut runs = self.fetch_all(&sources, window).await;

        report.enter(Phase::Normalizing);
        let mut records = Vec::new();
        for source in &sources {
            let run = runs.remove(source).unwrap_or_else(|| {
                SourceRun::failed(*source, AdapterError::SourceUnavailable(*source, "worker task aborted".into()))
            });
            records.extend(run.records);
            report.sources.push(run.report);
        }

        if report.succeeded_sources().is_empty() {
            report.fail("no source succeeded; ledger left untouched");
            return report;
        }

        report.enter(Phase::Merging);
        let span = identity_span(window, &records);
        let existing = match self.sink.read_identities(Some(span)).await {
            Ok(existing) => existing,
            Err(err) => {
                report.fail(format!("reading ledger identities: {err:#}"));
                return report;
            }
        };
        let plan = plan_merge(&existing, records);
        report.collapsed = plan.collapsed;
        match apply_plan(self.sink.as_ref(), &plan).await {
            Ok(counts) => report.merge = Some(counts),
            Err(err) => report.sink_failure = Some(err),
        }

        report.finish();
        info!(run_id = %report.run_id, outcome = report.outcome().as_str(), "sync run finished");
        report
    }

    async fn fetch_all(&self, sources: &[Source], window: DateWindow) -> BTreeMap<Source, SourceRun> {
        let ctx = Arc::new(SourceContext {
            registry: self.registry.clone(),
            credentials: self.credentials.clone(),
            http: self.http.clone(),
            tz: self.tz,
        });
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut tasks = JoinSet::new();
        for &source in sources {
            let ctx = ctx.clone();
            let permits = permits.clone();
            tasks.spawn(async move {
                let _permit = permits.acquire_owned().await.ok();
                sync_source(ctx, source, window).await
            });
        }

        let mut runs = BTreeMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(run) => {
                    runs.insert(run.report.source, run);
                }
                Err(err) => warn!(error = %err, "source worker did not complete"),
            }
        }
        runs
    }

    /// One authenticated request per selected source, without touching the ledger.
    pub async fn verify_sources(&self, sources: &[Source]) -> Vec<(Source, Result<(), AdapterError>)> {
        let today = self.today();
        let mut out = Vec::new();
        for &source in sources {
            let result = self.probe_source(source, today).await;
            match &result {
                Ok(()) => info!(%source, "source reachable"),
                Err(err) => warn!(%source, kind = err.kind(), error = %err, "source check failed"),
            }
            out.push((source, result));
        }
        out
    }

    async fn probe_source(&self, source: Source, today: NaiveDate) -> Result<(), AdapterError> {
        let secret = match self.credentials.get_secret(source).await {
            Ok(secret) => Some(secret),
            Err(CredentialError::Missing(_)) => None,
            Err(err) => return Err(AdapterError::MissingCredential(source, err.to_string())),
        };
        let adapter = build_adapter(source, secret, &self.registry.settings(source), self.http.clone())?;
        let (renewed, result) = match adapter.probe(today).await {
            Ok(output) => (
                Renewed {
                    tokens: output.refreshed_tokens,
                    session: output.refreshed_session,
                },
                Ok(()),
            ),
            Err(failed) => (
                Renewed {
                    tokens: failed.refreshed_tokens,
                    session: failed.refreshed_session,
                },
                Err(failed.error),
            ),
        };
        if let Err(err) = renewed.persist(self.credentials.as_ref(), source).await {
            warn!(%source, error = %err, "renewed credentials were not stored");
        }
        result
    }
}
