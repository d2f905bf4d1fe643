use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "adwatch")]
#[command(about = "Classifieds watch-and-notify pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Complete one scrape-dedupe-notify run and exit.
    Run,
    /// Keep running on the configured cron schedule.
    Watch,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let summary = adwatch_run::run_once_from_env().await?;
            println!(
                "run complete: run_id={} extracted={} novel={} fragments={} failures={}",
                summary.run_id,
                summary.listings_extracted,
                summary.novel_listings,
                summary.fragments_sent,
                summary.source_failures.len()
            );
        }
        Commands::Watch => {
            let mut app = adwatch_run::AppConfig::from_env();
            app.scheduler_enabled = true;
            let orchestrator = Arc::new(adwatch_run::orchestrator_from_env(&app).await?);
            if let Some(scheduler) =
                adwatch_run::maybe_build_scheduler(&app, orchestrator).await?
            {
                scheduler.start().await.context("starting scheduler")?;
                tracing::info!(cron = %app.watch_cron, "watch schedule started");
                tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            }
        }
    }

    Ok(())
}
