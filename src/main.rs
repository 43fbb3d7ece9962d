use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use sync_orchestrator::SyncOrchestrator;

/// Cross-domain synchronization engine
#[derive(Debug, Parser)]
#[command(name = "sync-orchestrator", version, about)]
struct Args {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log filter, overrides `logging.level`
    #[arg(short, long)]
    log_level: Option<String>,

    /// Register scripted agents for every domain
    #[cfg(feature = "dry-run")]
    #[arg(long)]
    dry_run: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let orchestrator =
        SyncOrchestrator::new(args.config.as_deref(), args.log_level.as_deref()).await?;

    #[cfg(feature = "dry-run")]
    if args.dry_run {
        orchestrator.register_dry_run_agents()?;
    }

    orchestrator.start().await?;
    info!("Press Ctrl+C to stop");

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    orchestrator.stop().await?;

    let metrics = orchestrator.metrics();
    info!("Final metrics: {}", serde_json::to_string(&metrics)?);

    Ok(())
}
