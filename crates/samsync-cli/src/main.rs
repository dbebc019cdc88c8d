use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use samsync_core::{DateRange, FilterSet};
use samsync_engine::{EngineOptions, SyncEngine};
use samsync_http::{HttpClient, HttpClientConfig};
use samsync_sharepoint::{
    AzureAdConfig, ClientCredentialsTokenProvider, SharePointClient, SharePointConfig,
};
use samsync_source::{SamClient, SamConfig};
use tracing::warn;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "samsync")]
#[command(about = "One-way sync of SAM.gov contract opportunities into a SharePoint list")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync pass over the configured window.
    Sync(SyncArgs),
    /// Verify credentials and resolve the destination site and list.
    CheckAuth,
}

#[derive(Debug, Args, Default)]
struct SyncArgs {
    /// How many days back to pull opportunities (ignored when --from/--to set).
    #[arg(long)]
    days_back: Option<u32>,
    /// Explicit window start, YYYY-MM-DD.
    #[arg(long, value_name = "DATE", requires = "to")]
    from: Option<NaiveDate>,
    /// Explicit window end, YYYY-MM-DD.
    #[arg(long, value_name = "DATE", requires = "from")]
    to: Option<NaiveDate>,
    /// Create records without downloading PDF attachments.
    #[arg(long)]
    skip_attachments: bool,
    /// Upper bound on source pages fetched this run.
    #[arg(long)]
    max_pages: Option<u64>,
    /// Optional agency-department facet.
    #[arg(long)]
    department: Option<String>,
    /// Optional NAICS-code facet.
    #[arg(long)]
    naics: Option<String>,
}

#[derive(Debug, Clone)]
struct AppConfig {
    sam_api_key: String,
    tenant_id: String,
    client_id: String,
    client_secret: String,
    site_url: String,
    list_name: String,
    days_to_sync: u32,
    /// SAM.gov allows 10 req/s; 110ms keeps a safety margin.
    sam_min_interval_ms: u64,
    graph_min_interval_ms: u64,
    http_timeout_secs: u64,
    user_agent: String,
}

impl AppConfig {
    fn from_env() -> Result<Self> {
        Ok(Self {
            sam_api_key: required_env("SAM_API_KEY")?,
            tenant_id: required_env("AZURE_TENANT_ID")?,
            client_id: required_env("AZURE_CLIENT_ID")?,
            client_secret: required_env("AZURE_CLIENT_SECRET")?,
            site_url: required_env("SHAREPOINT_SITE_URL")?,
            list_name: std::env::var("SHAREPOINT_LIST_NAME")
                .unwrap_or_else(|_| "SAM Opportunities".to_string()),
            days_to_sync: env_parsed("DAYS_TO_SYNC", 30),
            sam_min_interval_ms: env_parsed("SAM_MIN_INTERVAL_MS", 110),
            graph_min_interval_ms: env_parsed("GRAPH_MIN_INTERVAL_MS", 100),
            http_timeout_secs: env_parsed("SAMSYNC_HTTP_TIMEOUT_SECS", 30),
            user_agent: std::env::var("SAMSYNC_USER_AGENT")
                .unwrap_or_else(|_| "samsync/0.1".to_string()),
        })
    }

    fn http_config(&self, min_interval_ms: u64) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            min_request_interval: Some(Duration::from_millis(min_interval_ms)),
            ..Default::default()
        }
    }
}

fn required_env(name: &str) -> Result<String> {
    std::env::var(name).with_context(|| format!("missing required environment variable {name}"))
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn build_sharepoint(config: &AppConfig) -> Result<Arc<SharePointClient>> {
    let graph_http = HttpClient::new(config.http_config(config.graph_min_interval_ms))?;
    let tokens = Arc::new(ClientCredentialsTokenProvider::new(
        AzureAdConfig {
            tenant_id: config.tenant_id.clone(),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        },
        graph_http.clone(),
    ));
    Ok(Arc::new(SharePointClient::new(
        SharePointConfig {
            site_url: config.site_url.clone(),
            list_name: config.list_name.clone(),
        },
        graph_http,
        tokens,
    )?))
}

async fn run_sync(config: &AppConfig, args: &SyncArgs) -> Result<()> {
    let window = match (args.from, args.to) {
        (Some(from), Some(to)) => DateRange::new(from, to),
        _ => DateRange::days_back(args.days_back.unwrap_or(config.days_to_sync)),
    };
    let filters = FilterSet {
        department: args.department.clone(),
        naics_code: args.naics.clone(),
    };

    let sam_http = HttpClient::new(config.http_config(config.sam_min_interval_ms))?;
    let source = Arc::new(SamClient::new(
        SamConfig::new(config.sam_api_key.clone()),
        sam_http,
    ));
    let destination = build_sharepoint(config)?;

    let mut options = EngineOptions {
        include_attachments: !args.skip_attachments,
        ..Default::default()
    };
    if let Some(max_pages) = args.max_pages {
        options.max_pages = max_pages;
    }

    let engine = SyncEngine::new(source, destination, options);

    let cancel = engine.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("shutdown requested; stopping after the current item");
            cancel.cancel();
        }
    });

    // Per-item failures are reported, not fatal; only a failed index load
    // propagates and makes the process exit non-zero.
    let summary = engine.run(&window, &filters).await?;

    println!(
        "sync complete: run_id={} status={:?} created={} skipped={} failed={} attachments={}+{} pages={}{}",
        summary.run_id,
        summary.status,
        summary.created,
        summary.skipped,
        summary.failed,
        summary.attachments_added,
        summary.attachments_failed,
        summary.pages_fetched,
        if summary.source_truncated {
            " (source truncated)"
        } else {
            ""
        }
    );
    for failure in &summary.failures {
        println!(
            "  failure [{:?}] {}: {}",
            failure.stage,
            failure.notice_id.as_deref().unwrap_or("-"),
            failure.reason
        );
    }
    Ok(())
}

async fn run_check_auth(config: &AppConfig) -> Result<()> {
    let sharepoint = build_sharepoint(config)?;
    let (site_id, list_id) = sharepoint.verify_access().await?;
    println!("authentication ok");
    println!("site id: {site_id}");
    println!("list id: {list_id}");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = AppConfig::from_env()?;

    match cli.command.unwrap_or(Commands::Sync(SyncArgs::default())) {
        Commands::Sync(args) => run_sync(&config, &args).await,
        Commands::CheckAuth => run_check_auth(&config).await,
    }
}
