use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use bosun_agent::Agent;
use bosun_config::{CONFIG_FILE, load_config};

#[derive(Parser, Debug)]
#[command(name = "bosun-agent", version)]
#[command(about = "Guest-side deployment agent: runs signed execution plans delivered over AMQP")]
struct Cli {
    /// Path to the configuration file.
    #[arg(long, default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Override the storage directory for plans and file caches.
    #[arg(long)]
    storage: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = load_config(&cli.config)?;
    if let Some(storage) = cli.storage {
        config.set_storage(storage);
    }

    let mut agent = Agent::new(config)?;
    tokio::select! {
        outcome = agent.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted; shutting down");
            Ok(())
        }
    }
}
