use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;
use wxh_adapters::{parse_forecast_page, ScrapeTime};
use wxh_sync::{SyncConfig, SyncPipeline};

#[derive(Debug, Parser)]
#[command(name = "wxh-cli")]
#[command(about = "Weather forecast harvester")]
struct Cli {
    /// SQLite database file; `.db` is appended when missing.
    #[arg(long, global = true)]
    database: Option<String>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Create the schema and load the city registry.
    Setup,
    /// Run one harvest cycle now.
    Sync,
    /// Run harvest cycles on the configured cron schedule until Ctrl-C.
    Schedule,
    /// Parse a saved forecast page and print its records as JSON.
    Parse {
        file: PathBuf,
        /// Scrape clock as RFC 3339; defaults to the current time.
        #[arg(long)]
        now: Option<String>,
        #[arg(long, default_value_t = 0)]
        city_id: i64,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let mut config = SyncConfig::from_env();
    if let Some(path) = &cli.database {
        config = config.with_database_path(path);
    }

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Setup => {
            let pipeline = SyncPipeline::connect(config).await?;
            let added = pipeline.setup().await?;
            println!("setup complete: cities_added={added}");
        }
        Commands::Sync => {
            let pipeline = SyncPipeline::connect(config).await?;
            let summary = pipeline.run_once(Utc::now()).await?;
            println!(
                "sync complete: run_id={} cities={} inserted={} discarded={} failed={} current={}",
                summary.run_id,
                summary.cities,
                summary.inserted,
                summary.discarded,
                summary.failures.len(),
                summary
                    .current_inserted
                    .map_or_else(|| "skipped".to_string(), |n| n.to_string())
            );
        }
        Commands::Schedule => {
            let pipeline = Arc::new(SyncPipeline::connect(config).await?);
            let mut sched = pipeline.build_scheduler().await?;
            sched.start().await.context("starting scheduler")?;
            info!(cron = %pipeline.config().sync_cron, "scheduler running; press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("waiting for Ctrl-C")?;
            sched.shutdown().await.context("stopping scheduler")?;
        }
        Commands::Parse { file, now, city_id } => {
            let now = match now {
                Some(raw) => DateTime::parse_from_rfc3339(&raw)
                    .with_context(|| format!("parsing --now {raw}"))?
                    .with_timezone(&Utc),
                None => Utc::now(),
            };
            let time = ScrapeTime::at(now, config.utc_offset_hours)
                .context("utc offset out of range")?;
            let html = std::fs::read_to_string(&file)
                .with_context(|| format!("reading {}", file.display()))?;
            let records = parse_forecast_page(&html, city_id, &time)
                .with_context(|| format!("parsing {}", file.display()))?;
            println!("{}", serde_json::to_string_pretty(&records)?);
        }
    }

    Ok(())
}
