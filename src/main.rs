mod cli;
mod commands;

use clap::Parser;
use cli::Cli;
use logvault::observability;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    observability::init_tracing();

    let cli = Cli::parse();
    commands::run(cli.command).await
}
