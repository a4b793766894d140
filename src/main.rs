mod cli;
mod config;
mod ledger;
mod parrot;
mod quiz;
mod scheduler;
mod selector;
mod steal;
mod store;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "guildgames")]
#[command(about = "Guild minigames: a shared parrot to keep fed, credit heists, and timed trivia")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the interactive game shell
    Run {
        /// Directory for save files
        #[arg(long)]
        data_dir: Option<PathBuf>,
        /// Guild the shell session acts in
        #[arg(long, default_value = "local")]
        guild: String,
        /// User the shell session acts as
        #[arg(long, default_value = "player")]
        user: String,
    },
    /// Show a summary of the saved game state
    Status {
        /// Directory for save files
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run { data_dir, guild, user } => cli::handle_run(data_dir, guild, user).await,
        Commands::Status { data_dir } => cli::handle_status(data_dir).await,
    }
}
