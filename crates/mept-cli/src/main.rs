use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use mept_sync::{build_scheduler, report_daily_markdown, SyncConfig, SyncPipeline};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "mept-cli")]
#[command(about = "Malta electronics price tracker")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one reconciliation cycle and exit.
    Sync,
    /// Run cycles on SYNC_CRON until interrupted.
    Schedule,
    /// Print a markdown summary of recent runs.
    Report {
        #[arg(long, default_value_t = 7)]
        runs: usize,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env();

    match cli.command.unwrap_or(Commands::Sync) {
        Commands::Sync => {
            let summary = SyncPipeline::new(config)?.run_once().await?;
            println!(
                "sync complete: run_id={} stores={} listings={} matches={} new={} removed={} up={} down={} reports={}",
                summary.run_id,
                summary.enabled_stores,
                summary.accepted_listings,
                summary.clusters,
                summary.new,
                summary.removed,
                summary.increased,
                summary.decreased,
                summary.reports_dir
            );
            if summary.state_unreadable {
                eprintln!("warning: previous state was unreadable; this run started from empty");
            }
        }
        Commands::Schedule => {
            let config = SyncConfig {
                scheduler_enabled: true,
                ..config
            };
            let cron = config.sync_cron.clone();
            let pipeline = Arc::new(SyncPipeline::new(config)?);
            let Some(sched) = build_scheduler(pipeline).await? else {
                bail!("scheduler could not be built");
            };
            sched.start().await.context("starting scheduler")?;
            info!(%cron, "scheduler running; ctrl-c to stop");
            tokio::signal::ctrl_c().await.context("waiting for ctrl-c")?;
            info!("shutting down");
        }
        Commands::Report { runs } => {
            print!("{}", report_daily_markdown(runs, &config.reports_dir)?);
        }
    }

    Ok(())
}
