//! Playbook CLI: methodology-grounded guidance for project tasks.
//!
//! Parses an implementation methodology, enriches tracker tasks with
//! phase-specific guidance, and answers questions about the process.

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
