use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use flora_adapters::ProviderAdapter;
use flora_core::{ConflictResolutionStrategy, ProviderRecord};
use flora_reconcile::ReconciliationEngine;
use flora_sync::{load_worklist, JsonDirPlantStore, SyncConfig, SyncScheduler, SyncWorker};
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "flora-cli")]
#[command(about = "FLORA botanical reconciliation and ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one sync over the worklist and exit.
    Sync {
        #[arg(long)]
        worklist: Option<PathBuf>,
    },
    /// Sync on a fixed interval until Ctrl-C.
    Run {
        #[arg(long)]
        worklist: Option<PathBuf>,
        #[arg(long)]
        interval_secs: Option<u64>,
    },
    /// Scrape one page and print the extracted record as JSON.
    Scrape {
        slug: String,
        #[arg(long, default_value = "almanac.com")]
        source: String,
        /// Keep the raw HTML in the output.
        #[arg(long)]
        raw: bool,
    },
    /// Print one page of a provider's species catalogue.
    List {
        /// `trefle` or `perenual`.
        provider: String,
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Merge a JSON array of provider records offline.
    MergeFixture {
        path: PathBuf,
        #[arg(long)]
        strategy: Option<ConflictResolutionStrategy>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync { worklist: None }) {
        Commands::Sync { worklist } => {
            let worklist_path = worklist.unwrap_or_else(|| config.worklist_path.clone());
            let entries = load_worklist(&worklist_path).await?;
            let summary = scheduler(&config)?.run_once(&entries).await;
            println!(
                "sync complete: run_id={} attempted={} persisted={} failed={} conflicts={} reports={}",
                summary.run_id,
                summary.attempted,
                summary.persisted,
                summary.failures.len(),
                summary.conflicts,
                summary.reports_dir.as_deref().unwrap_or("-")
            );
        }
        Commands::Run { worklist, interval_secs } => {
            let worklist_path = worklist.unwrap_or_else(|| config.worklist_path.clone());
            let interval = interval_secs
                .map(Duration::from_secs)
                .unwrap_or(config.sync_interval);
            let worker = SyncWorker::new(scheduler(&config)?, worklist_path, interval);
            let (_shutdown_tx, shutdown_rx) = watch::channel(false);
            let completed = worker.run(shutdown_rx).await;
            info!(completed, "worker exited");
        }
        Commands::Scrape { slug, source, raw } => {
            let scraper = config.page_scraper(config.http_fetcher()?)?;
            let mut record = scraper.scrape(&slug, &source).await;
            if !raw {
                record.raw_html.clear();
            }
            println!("{}", serde_json::to_string_pretty(&record)?);
        }
        Commands::List { provider, page } => {
            let http = config.http_fetcher()?;
            let adapter = config
                .provider_adapters(&http)
                .into_iter()
                .find(|a| a.provider().key() == provider.to_ascii_lowercase())
                .ok_or_else(|| anyhow!("provider `{provider}` is unknown or has no API key"))?;
            let species = adapter
                .list(page)
                .await
                .with_context(|| format!("listing {provider} page {page}"))?;
            println!("{}", serde_json::to_string_pretty(&species)?);
            for (source, stats) in http.api_calls().day(chrono::Utc::now().date_naive()) {
                info!(%source, calls = stats.calls, failed = stats.failures, "api calls today");
            }
        }
        Commands::MergeFixture { path, strategy } => {
            let records = read_fixture(&path).await?;
            let strategy = strategy.unwrap_or(config.conflict_strategy);
            let result = ReconciliationEngine::default()
                .merge(&records, strategy)
                .with_context(|| format!("merging {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&result)?);
        }
    }

    Ok(())
}

fn scheduler(config: &SyncConfig) -> Result<SyncScheduler> {
    let store = Arc::new(JsonDirPlantStore::new(&config.output_dir));
    SyncScheduler::from_config(config, store)
}

async fn read_fixture(path: &Path) -> Result<Vec<ProviderRecord>> {
    let text = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}
