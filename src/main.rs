//! swarm - distributed load generation

use anyhow::Result;
use clap::Parser;

mod cli;
mod demo;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = cli::Cli::parse();

    let level = if cli.verbose {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(level.into())
                .from_env_lossy(),
        )
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "swarm starting");

    cli::dispatch(cli.command).await
}
