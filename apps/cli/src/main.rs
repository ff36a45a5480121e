//! Docflow CLI — ingestion pipeline orchestrator.
//!
//! Runs the six-pass pipeline over a directory of source documents and
//! manages the resulting jobs: status, deletion proposals, configuration.

mod commands;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
