mod commands;
mod config;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{auth_url::AuthUrlCommand, backup::BackupCommand, restore::RestoreCommand, run::RunCommand};
use config::AppConfig;
use std::path::PathBuf;
use tracing::debug;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(
    name = "tidevault",
    about = "Unattended incremental backups to OneDrive",
    long_about = "Tidevault archives changed files into size-bounded, optionally encrypted ZIP parts and uploads them to OneDrive on a schedule"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[arg(long, global = true, env = "TIDEVAULT_CONFIG", help = "Config file path")]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, global = true, help = "Enable quiet mode")]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    #[command(about = "Run the scheduled backup service")]
    Run(RunCommand),

    #[command(about = "Run a single backup now")]
    Backup(BackupCommand),

    #[command(about = "Restore files from local part files")]
    Restore(RestoreCommand),

    #[command(about = "Print the OneDrive authorization URL")]
    AuthUrl(AuthUrlCommand),
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref())?;

    init_tracing(cli.verbose, cli.quiet, config.log.level.as_deref());

    debug!(state_dir = %config.state_dir().display(), "Configuration loaded");

    match cli.command {
        Commands::Run(ref cmd) => cmd.run(&config).await,
        Commands::Backup(ref cmd) => cmd.run(&config).await,
        Commands::Restore(ref cmd) => cmd.run(&config).await,
        Commands::AuthUrl(ref cmd) => cmd.run(&config).await,
    }
}

fn init_tracing(verbose: bool, quiet: bool, configured: Option<&str>) {
    let level = if quiet {
        "warn"
    } else if verbose {
        "debug"
    } else {
        configured.unwrap_or("info")
    };

    let filter = ["tidevault", "tidevault_core", "tidevault_backends"]
        .iter()
        .map(|target| format!("{}={}", target, level))
        .collect::<Vec<_>>()
        .join(",");

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::new(filter))
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("Setting default subscriber failed: {}", e);
    }
}
