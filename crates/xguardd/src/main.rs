mod cli;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use xguard_commons::utils::config::load_config;
use xguard_engine::Orchestrator;

use crate::cli::Cli;

fn init_logging(level: &str) {
    let filter = EnvFilter::try_new(level)
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.effective_log_level());

    let config = load_config(&cli.config)?;
    let orchestrator = Orchestrator::new(config).await?;
    info!("xguard starting");
    orchestrator.run().await
}
