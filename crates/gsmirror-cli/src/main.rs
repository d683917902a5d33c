use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gsmirror_pipeline::{maybe_build_scheduler, MirrorConfig, MirrorPipeline};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "gsmirror")]
#[command(about = "Gold Standard registry mirror")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the crawl-normalize-download pipeline once.
    Run,
    /// Keep the process alive and refresh the mirror on the configured cron.
    Schedule,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let pipeline = MirrorPipeline::new(MirrorConfig::from_env())?;
            let stop = pipeline.stop_signal();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    warn!("ctrl-c received, finishing current unit and flushing partial output");
                    stop.trigger();
                }
            });

            let summary = pipeline.run_once().await?;
            println!(
                "mirror run {} complete: {} records ({} pages ok, {} failed), {} goals, {} files downloaded ({} skipped, {} failed) -> {}",
                summary.run_id,
                summary.records,
                summary.pages_fetched,
                summary.pages_failed,
                summary.goal_rows,
                summary.files_downloaded,
                summary.files_skipped,
                summary.files_failed,
                summary.records_csv,
            );
        }
        Commands::Schedule => {
            let mut config = MirrorConfig::from_env();
            config.scheduler_enabled = true;
            let pipeline = Arc::new(MirrorPipeline::new(config)?);

            let sched = maybe_build_scheduler(Arc::clone(&pipeline))
                .await?
                .context("scheduler unexpectedly disabled")?;
            sched.start().await.context("starting scheduler")?;
            info!("scheduler running; press ctrl-c to exit");

            tokio::signal::ctrl_c().await?;
            pipeline.stop_signal().trigger();
            info!("ctrl-c received, shutting down scheduler");
        }
    }

    Ok(())
}
