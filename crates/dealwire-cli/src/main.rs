use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use dealwire_ingest::{maybe_build_scheduler, IngestConfig, Ingestor};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "dealwire")]
#[command(about = "Dealwire promo deal aggregation pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one ingestion pass over the configured sources.
    Ingest,
    /// Delete expired deals and anything past the retention window.
    Cleanup {
        #[arg(long)]
        retention_days: Option<i64>,
    },
    /// Serve the JSON API.
    Serve,
    /// Serve the JSON API with the cron scheduler enabled.
    Run,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = IngestConfig::from_env();

    match cli.command.unwrap_or(Commands::Ingest) {
        Commands::Ingest => {
            let ingestor = Ingestor::new(config).await?;
            let summary = ingestor.run_ingestion().await?;
            println!(
                "ingestion complete: run_id={} sources={} candidates={} added={}",
                summary.run_id, summary.sources_run, summary.candidates, summary.inserted
            );
        }
        Commands::Cleanup { retention_days } => {
            let ingestor = Ingestor::new(config).await?;
            let retention = retention_days
                .map(chrono::Duration::days)
                .unwrap_or_else(|| ingestor.retention());
            let deleted = ingestor.run_cleanup(retention).await?;
            println!("cleanup complete: deleted={deleted}");
        }
        Commands::Serve => {
            let ingestor = Arc::new(Ingestor::new(config).await?);
            dealwire_api::serve_from_env(ingestor).await?;
        }
        Commands::Run => {
            config.scheduler_enabled = true;
            let ingestor = Arc::new(Ingestor::new(config).await?);
            if let Some(scheduler) = maybe_build_scheduler(ingestor.clone()).await? {
                scheduler.start().await?;
            }
            dealwire_api::serve_from_env(ingestor).await?;
        }
    }

    Ok(())
}
