mod cmd;
mod output;

use clap::{Parser, Subcommand};
use cmd::{config::ConfigSubcommand, log::LogSubcommand};
use std::path::PathBuf;
use tenant_core::config::CONFIG_FILE;

#[derive(Parser)]
#[command(
    name = "tenantctl",
    about = "Tenant orchestrator operations: configuration and saga log inspection",
    version,
    propagate_version = true
)]
struct Cli {
    /// Orchestrator config file
    #[arg(long, global = true, env = "TENANTCTL_CONFIG", default_value = CONFIG_FILE)]
    config: PathBuf,

    /// Output as JSON
    #[arg(long, global = true, short = 'j')]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create, show and validate the orchestrator config
    Config {
        #[command(subcommand)]
        subcommand: ConfigSubcommand,
    },

    /// Inspect runs recorded in the saga log
    Log {
        #[command(subcommand)]
        subcommand: LogSubcommand,
    },
}

fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::WARN.into()),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Config { subcommand } => cmd::config::run(&cli.config, subcommand, cli.json),
        Commands::Log { subcommand } => cmd::log::run(&cli.config, subcommand, cli.json),
    };

    if let Err(e) = result {
        // Print the full error chain (anyhow's alternate Display)
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}
