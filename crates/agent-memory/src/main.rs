#[cfg(feature = "cli")]
use agent_memory::{metrics, telemetry, MemoryConfig, MemoryService};
#[cfg(feature = "cli")]
use clap::{Parser, Subcommand};

#[cfg(feature = "cli")]
#[derive(Parser)]
#[command(name = "agent-memory", about = "Conversation memory and knowledge store for agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[cfg(feature = "cli")]
#[derive(Subcommand)]
enum Command {
    /// Run the retention sweeper until interrupted
    Serve,
    /// Run a single retention sweep and exit
    Sweep,
    /// Print store statistics as JSON
    Stats,
    /// Consolidate one conversation now
    Consolidate { conversation_id: String },
    /// Print Prometheus metrics after a read-only stats pass
    Metrics,
}

#[cfg(feature = "cli")]
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_tracing("agent_memory=info");
    metrics::init_metrics();

    let cli = Cli::parse();
    let cfg = MemoryConfig::from_env()?;
    cfg.print_config();
    let service = MemoryService::open(cfg)?;

    match cli.command {
        Command::Serve => {
            let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
            let handle = service.spawn_sweeper(shutdown_rx);
            tokio::signal::ctrl_c().await?;
            tracing::info!("Shutdown requested, stopping sweeper");
            shutdown_tx.send(true).ok();
            handle.await?;
        }
        Command::Sweep => {
            let report = service.sweeper().run_once().await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Command::Stats => {
            let stats = service.stats().await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        Command::Consolidate { conversation_id } => {
            let outcome = service.consolidate(&conversation_id).await?;
            println!("{}", outcome.label());
        }
        Command::Metrics => {
            // Stats reads the store only, so the store histograms have data.
            service.stats().await?;
            print!("{}", metrics::render());
        }
    }
    Ok(())
}

#[cfg(not(feature = "cli"))]
fn main() {
    println!("CLI feature not enabled. Enable with --features cli");
}
