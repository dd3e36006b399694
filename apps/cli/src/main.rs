//! Event Catalog CLI.
//!
//! Discovers local fundraising events through web search, assembles each one
//! from its pages, resolves the organizing nonprofit and keeps the result in
//! a local catalog database.

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
