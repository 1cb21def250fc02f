//! devherd - Development-environment process supervisor
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use devherd_app::DEFAULT_CONFIG_FILE;
use devherd_core::logging;

/// devherd - start, stop and watch a whole dev environment from one place
#[derive(Parser, Debug)]
#[command(name = "devherd")]
#[command(about = "Development-environment process supervisor", long_about = None)]
struct Args {
    /// Path to the service topology
    #[arg(short, long, value_name = "PATH", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Bring up the core set and stream events as NDJSON (default)
    Up,
    /// List the configured services without starting anything
    Status {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Validate the topology and probe pm2, docker and the bridge
    Check,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    match args.command.unwrap_or(Command::Up) {
        Command::Up => {
            logging::init()?;
            devherd::run_headless(&args.config).await?;
        }
        Command::Status { json } => devherd::print_status(&args.config, json)?,
        Command::Check => {
            if !devherd::run_check(&args.config).await? {
                std::process::exit(1);
            }
        }
    }
    Ok(())
}
