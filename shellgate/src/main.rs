mod commands;
mod config;
mod logging;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[clap(author, version, about = "Web-accessed remote shell gateway")]
pub struct Cli {
    #[clap(long, short, default_value = "shellgate.yaml", action)]
    config: PathBuf,

    #[clap(long, short, action = clap::ArgAction::Count)]
    debug: u8,

    #[clap(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the gateway
    Run,
    /// Validate the config file and exit
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init_logging(&cli)?;

    match cli.command {
        Commands::Run => commands::run::command(&cli).await,
        Commands::Check => commands::check::command(&cli).await,
    }
}
