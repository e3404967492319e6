//! cap-orchestrator - a single-host, on-demand orchestrator for
//! heavyweight containerized inference/compute services.

use anyhow::Result;
use clap::Parser;
use tracing::{error, info};

mod cmd;

#[derive(Parser)]
#[command(name = "cap-orchestrator")]
#[command(about = "On-demand container orchestrator for inference/compute services")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<cmd::Commands>,

    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("cap_orchestrator={}", log_level).into()),
        )
        .init();

    info!("starting cap-orchestrator v{}", env!("CARGO_PKG_VERSION"));

    match cli.command {
        Some(cmd::Commands::Diagnostics) => {
            cmd::diagnostics::run().await?;
        }
        None => {
            if let Err(e) = cmd::root::run(&cli.config).await {
                error!("daemon error: {}", e);
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
