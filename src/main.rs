mod cli;
mod engine;
mod error;
mod model;
mod report;
mod stats;
mod storage;
mod targets;

use anyhow::Result;
use clap::Parser;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();
    cli::init_logging(&args);
    cli::run(args).await
}
