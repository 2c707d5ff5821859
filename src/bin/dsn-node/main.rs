//! dsn-node CLI entry point.

mod cli;

use clap::Parser;
use cli::{Cli, LogFormat};
use dsn_node::NodeBuilder;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    // Initialize error handling
    color_eyre::install()?;

    let cli = Cli::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let json = matches!(cli.log_format, LogFormat::Json);

    tracing_subscriber::registry()
        .with(json.then(|| fmt::layer().json()))
        .with((!json).then(fmt::layer))
        .with(filter)
        .init();

    info!("dsn-node v{}", env!("CARGO_PKG_VERSION"));

    let config = cli.into_config()?;

    let mut node = NodeBuilder::new(config).build().await?;
    for addr in node.handle().dialable_addrs() {
        info!(address = %addr, "Dial this node at");
    }

    node.run().await?;

    info!("Goodbye!");
    Ok(())
}
