pub mod auto_backup;
pub mod commands;
pub mod config;
pub mod logger;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::auto_backup::BackupRegistry;
use crate::commands::backup;
use crate::config::Settings;

#[derive(Parser)]
#[command(name = "backup-steward")]
#[command(about = "Backup capture and retention engine for a dedicated game server", long_about = None)]
struct Cli {
    /// Settings file
    #[arg(short, long, default_value = "backup-steward.yaml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Watch the save directory and capture backups until Ctrl-C
    Run,
    /// List backups, newest first
    List {
        /// Maximum number of backups to show (0 shows all)
        #[arg(short, long, default_value_t = 0)]
        limit: i64,
    },
    /// Capture a backup now
    Create {
        /// copy, tar or zip
        #[arg(short, long, default_value = "zip")]
        mode: String,
    },
    /// Restore a backup into the live save directory
    Restore {
        /// Backup index as shown by `list`
        index: i64,
        /// Do not capture the live directory before restoring
        #[arg(long)]
        skip_pre_backup: bool,
    },
    /// Apply the retention policy once
    Cleanup,
    /// Show manager state
    Status,
}

pub fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load(&cli.config)
        .with_context(|| format!("Failed to load settings from {}", cli.config.display()))?;
    logger::initialize_logging_with_config(settings.log_config())?;

    let runtime = tokio::runtime::Runtime::new().context("Failed to create Tokio runtime")?;
    runtime.block_on(execute(cli.command, settings))
}

async fn execute(command: Commands, settings: Settings) -> anyhow::Result<()> {
    let config = settings.backup_config()?;
    let registry = BackupRegistry::new();

    if let Commands::Run = command {
        registry.install(config).await;
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
        tracing::info!("Interrupt received, shutting down");
        registry.shutdown().await;
        return Ok(());
    }

    let manager = registry.install_idle(config).await;
    let outcome = async {
        match command {
            Commands::List { limit } => print_json(&backup::list_backups(&registry, limit).await?),
            Commands::Create { mode } => print_json(&backup::create_backup(&registry, &mode).await?),
            Commands::Restore {
                index,
                skip_pre_backup,
            } => print_json(&backup::restore_backup(&registry, index, skip_pre_backup).await?),
            Commands::Cleanup => print_json(&manager.cleanup().await?),
            Commands::Status => print_json(&backup::backup_status(&registry)?),
            Commands::Run => Ok(()),
        }
    }
    .await;
    registry.shutdown().await;
    outcome
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
