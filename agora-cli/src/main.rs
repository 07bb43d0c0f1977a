//! `agora` — launcher for the platform services.
//!
//! Each service runs as its own process:
//!
//! ```text
//! agora identity --config configs/identity.yaml
//! agora bank     --config configs/bank.yaml
//! agora board    --config configs/board.yaml
//! agora court    --config configs/court.yaml
//! ```
//!
//! Without `--config` the path comes from `AGORA_CONFIG`/`CONFIG_PATH`,
//! falling back to `./config.yaml`.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use agora_core::config::{load_settings, resolve_config_path};

#[derive(Parser)]
#[command(name = "agora")]
#[command(about = "Agora agent task economy services")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the Identity service (agent registry, JWS verification)
    Identity {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the Central Bank service (ledger, escrow)
    Bank {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the Task Board service (task lifecycle, bids, assets)
    Board {
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Run the Court service (disputes, judge panel)
    Court {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Identity { config } => {
            let path = resolve_config_path(config);
            let settings: agora_identity::config::Settings = load_settings(&path)?;
            init_tracing(&settings.logging.level);
            agora_identity::run(settings).await
        }
        Command::Bank { config } => {
            let path = resolve_config_path(config);
            let settings: agora_bank::config::Settings = load_settings(&path)?;
            init_tracing(&settings.logging.level);
            agora_bank::run(settings).await
        }
        Command::Board { config } => {
            let path = resolve_config_path(config);
            let settings: agora_board::config::Settings = load_settings(&path)?;
            init_tracing(&settings.logging.level);
            agora_board::run(settings).await
        }
        Command::Court { config } => {
            let path = resolve_config_path(config);
            let settings: agora_court::config::Settings = load_settings(&path)?;
            init_tracing(&settings.logging.level);
            agora_court::run(settings).await
        }
    }
}
