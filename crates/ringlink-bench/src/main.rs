#![warn(missing_docs)]

//! `ringlink-bench` entry point.

use anyhow::Result;
use clap::Parser;
use ringlink_bench::cli::Cli;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    tracing::debug!(command = ?cli.command, "ringlink-bench starting");
    cli.run().await
}
