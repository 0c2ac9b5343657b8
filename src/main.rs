use anyhow::Result;
use clap::Parser;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use berth::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "berth=info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Serve { config, port, host } => {
            berth::cli::serve(config, port, host).await?;
        }
        Commands::Models { config, verbose } => {
            berth::cli::models(config, verbose).await?;
        }
        Commands::Inspect { config, json } => {
            berth::cli::inspect(config, json).await?;
        }
    }

    Ok(())
}
