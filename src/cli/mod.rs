//! CLI commands

mod inspect;
mod models;
mod serve;

pub use inspect::inspect;
pub use models::models;
pub use serve::serve;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

/// Berth - priority admission queue and model pool for inference backends
#[derive(Parser)]
#[command(name = "berth")]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run workers, the idle reaper and the HTTP control plane
    Serve {
        /// Config file (YAML or JSON); falls back to BERTH_CONFIG
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Port to listen on (overrides config)
        #[arg(long)]
        port: Option<u16>,

        /// Host to bind to (overrides config)
        #[arg(long)]
        host: Option<String>,
    },

    /// List registered models and the weights found for them
    Models {
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Show detailed information
        #[arg(long, short)]
        verbose: bool,
    },

    /// Show queue statistics and in-flight requests from the work store snapshot
    Inspect {
        #[arg(long, short)]
        config: Option<PathBuf>,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
}
