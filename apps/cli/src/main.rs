//! ChatCorpus CLI — personal message export conversion tool.
//!
//! Converts CSV exports and message-database dumps into a normalized,
//! enriched JSON corpus and renders it as a Markdown timeline.

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
