use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use hsync_adapters::{authorization_link, complete_authorization, import_session, login_instructions};
use hsync_core::{Source, LEDGER_COLUMNS};
use hsync_storage::{FileCredentialStore, HttpFetcher};
use hsync_sync::{
    load_registry, parse_since, pipeline_from_config, verify_connectivity, LedgerTarget, PostgresLedger, SyncConfig,
    SyncMode, SyncReport, SyncRequest,
};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

const DEFAULT_REDIRECT_URI: &str = "http://localhost:8000/callback";

#[derive(Debug, Parser)]
#[command(name = "hsync")]
#[command(about = "Sync health and fitness data into one deduplicated ledger")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Sync a relative window ending today.
    Fetch {
        /// `<N>d` or an ISO start date.
        #[arg(long, default_value = "2d")]
        since: String,
        /// Restrict to these sources (comma separated); default is every enabled source.
        #[arg(long = "source", value_delimiter = ',')]
        sources: Vec<Source>,
    },
    /// Sync an explicit inclusive date range.
    Backfill {
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long = "source", value_delimiter = ',')]
        sources: Vec<Source>,
    },
    /// Probe the ledger and each source's credentials without syncing.
    VerifyConnectivity {
        #[arg(long = "source", value_delimiter = ',')]
        sources: Vec<Source>,
    },
    /// Store an exported browser session for a browser-only source.
    Login {
        source: Source,
        /// Storage-state JSON exported from a signed-in browser. Without it,
        /// the export steps are printed.
        #[arg(long)]
        state_file: Option<PathBuf>,
    },
    /// Connect an OAuth source. Without `--code`, prints the consent link;
    /// with it, exchanges the code and stores the token pair.
    Authorize {
        source: Source,
        /// Authorization code from the redirect back to `--redirect-uri`.
        #[arg(long)]
        code: Option<String>,
        /// Defaults to `<SOURCE>_REDIRECT_URI`, then a localhost callback.
        #[arg(long)]
        redirect_uri: Option<String>,
    },
    /// Create the Postgres ledger table.
    Migrate,
    /// Print the ledger column contract.
    Columns,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();
}

fn print_run(report: &SyncReport, dir: &std::path::Path) {
    let outcome = report.outcome();
    let merge = report.merge.unwrap_or_default();
    println!(
        "{} {}: outcome={} inserted={} updated={} skipped={} failed_sources={} skipped_payloads={} report={}",
        report.mode,
        report.run_id,
        outcome.as_str(),
        merge.inserted,
        merge.updated,
        merge.skipped,
        report.failed_sources().len(),
        report.skipped_records(),
        dir.display()
    );
}

async fn sync(mode: SyncMode, sources: Vec<Source>) -> Result<i32> {
    let (report, dir) = hsync_sync::run_sync_from_env(&SyncRequest { mode, sources }).await?;
    print_run(&report, &dir);
    Ok(report.outcome().exit_code())
}

async fn verify(sources: Vec<Source>) -> Result<i32> {
    let config = SyncConfig::from_env()?;
    let pipeline = pipeline_from_config(&config).await?;
    let sources = pipeline.selected_sources(&SyncRequest {
        mode: SyncMode::Fetch { since_days: 0 },
        sources,
    });
    let check = verify_connectivity(&pipeline, &sources).await;

    match &check.ledger {
        Ok(()) => println!("ledger  ok"),
        Err(err) => println!("ledger  FAILED  {err}"),
    }
    for (source, result) in &check.sources {
        match result {
            Ok(()) => println!("{source:<11} ok"),
            Err(err) => println!("{source:<11} FAILED  {err}"),
        }
    }
    Ok(if check.all_ok() { 0 } else { 1 })
}

async fn login(source: Source, state_file: Option<PathBuf>) -> Result<i32> {
    let Some(state_file) = state_file else {
        println!("{}", login_instructions(source));
        return Ok(0);
    };
    let exported = tokio::fs::read_to_string(&state_file)
        .await
        .with_context(|| format!("reading {}", state_file.display()))?;

    let config = SyncConfig::from_env()?;
    let registry = load_registry(&config).await?;
    let http = Arc::new(HttpFetcher::new(config.http_config(&registry)).context("building http client")?);
    let store = FileCredentialStore::with_env(config.state_dir.clone(), config.env.clone());
    let state = import_session(
        source,
        &exported,
        &registry.settings(source),
        http,
        &store,
        config.tz.today(),
    )
    .await?;
    println!(
        "{source} session stored in {} ({} cookies)",
        store.session_path(source).display(),
        state.cookies.len()
    );
    Ok(0)
}

async fn authorize(source: Source, code: Option<String>, redirect_uri: Option<String>) -> Result<i32> {
    let config = SyncConfig::from_env()?;
    let store = FileCredentialStore::with_env(config.state_dir.clone(), config.env.clone());
    let redirect_uri = redirect_uri
        .or_else(|| store.var(source, "REDIRECT_URI"))
        .unwrap_or_else(|| DEFAULT_REDIRECT_URI.to_string());
    let prefix = source.env_prefix();

    let Some(code) = code else {
        let client_id = store
            .var(source, "CLIENT_ID")
            .with_context(|| format!("{prefix}_CLIENT_ID is not set"))?;
        let state = Uuid::new_v4().simple().to_string();
        let link = authorization_link(source, &client_id, &redirect_uri, store.var(source, "AUTHORIZE_URL").as_deref(), &state)?;
        println!("Open this link, approve access, then run `hsync authorize {source} --code <code>`:");
        println!("{link}");
        println!("The redirect should carry state={state}.");
        return Ok(0);
    };

    let client = store
        .oauth_client(source)
        .with_context(|| format!("{prefix}_CLIENT_ID and {prefix}_CLIENT_SECRET must both be set"))?;
    let registry = load_registry(&config).await?;
    let http = HttpFetcher::new(config.http_config(&registry)).context("building http client")?;
    let tokens = complete_authorization(source, &client, &code, &redirect_uri, &http, &store).await?;
    println!(
        "{source} tokens stored in {} (refresh token: {})",
        store.tokens_path(source).display(),
        if tokens.refresh_token.is_some() { "yes" } else { "no" }
    );
    Ok(0)
}

async fn migrate() -> Result<i32> {
    let config = SyncConfig::from_env()?;
    let LedgerTarget::Postgres(url) = &config.ledger else {
        bail!("migrate needs HSYNC_LEDGER=postgres; the parquet ledger has no schema to create");
    };
    PostgresLedger::connect(url).await?.ensure_schema().await?;
    println!("table unified_ledger ready");
    Ok(0)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let code = match cli.command {
        Commands::Fetch { since, sources } => {
            let config = SyncConfig::from_env()?;
            let since_days = parse_since(&since, config.tz.today())?;
            sync(SyncMode::Fetch { since_days }, sources).await?
        }
        Commands::Backfill { start, end, sources } => sync(SyncMode::Backfill { start, end }, sources).await?,
        Commands::VerifyConnectivity { sources } => verify(sources).await?,
        Commands::Login { source, state_file } => login(source, state_file).await?,
        Commands::Authorize {
            source,
            code,
            redirect_uri,
        } => authorize(source, code, redirect_uri).await?,
        Commands::Migrate => migrate().await?,
        Commands::Columns => {
            for (i, column) in LEDGER_COLUMNS.iter().enumerate() {
                println!("{:>2} {column}", i + 1);
            }
            0
        }
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
