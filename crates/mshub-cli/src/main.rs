use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mshub_storage::PgSnapshotStore;
use mshub_sync::SyncConfig;
use mshub_web::WebConfig;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mshub-cli")]
#[command(about = "Mindshare leaderboard hub command-line interface")]
struct Cli {
    /// Debug-level logging unless RUST_LOG is set.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Fetch every enabled source once and publish complete snapshots.
    Sync,
    /// Ingest a scrape batch JSON file.
    Ingest {
        #[arg(long)]
        file: PathBuf,
    },
    /// Run the HTTP API.
    Serve {
        /// Run the cron sync scheduler alongside the API.
        #[arg(long)]
        scheduler: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Summarise recent sync runs.
    Report {
        #[arg(long, default_value_t = 5)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = mshub_sync::run_sync_once_from_env().await?;
            println!(
                "sync complete: run_id={} sources={} published={} skipped={} failed={} reports={}",
                summary.run_id,
                summary.enabled_sources,
                summary.published,
                summary.skipped,
                summary.failed,
                summary.reports_dir
            );
        }
        Commands::Ingest { file } => {
            let results = mshub_sync::ingest_batch_file_from_env(&file).await?;
            println!(
                "{}",
                serde_json::to_string_pretty(&results).context("serializing ingest results")?
            );
        }
        Commands::Serve { scheduler } => {
            let mut sync = SyncConfig::from_env();
            sync.scheduler_enabled |= scheduler;
            mshub_web::serve(WebConfig::from_env(), sync).await?;
        }
        Commands::Migrate => {
            let Some(url) = SyncConfig::from_env().database_url else {
                bail!("DATABASE_URL is required for migrate");
            };
            let store = PgSnapshotStore::connect(&url)
                .await
                .context("connecting to postgres")?;
            store.migrate().await.context("running migrations")?;
            info!("migrations applied");
        }
        Commands::Report { runs } => {
            let root = SyncConfig::from_env().workspace_root;
            println!("{}", mshub_sync::report_daily_markdown(runs, Some(root))?);
        }
    }

    Ok(())
}
