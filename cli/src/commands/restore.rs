use crate::config::AppConfig;
use anyhow::{anyhow, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::io::{self, Write};
use std::path::PathBuf;
use std::time::Duration;
use tidevault_core::{backup_id_for, restore, RestoreOutcome, RestoreRequest};
use tracing::info;

#[derive(Args)]
pub struct RestoreCommand {
    #[arg(long, help = "Directory holding the part files [default: backup.output_dir]")]
    from: Option<PathBuf>,

    #[arg(long, help = "Directory to restore into")]
    to: PathBuf,

    #[arg(long, help = "Backup ID [default: name of backup.root_dir]")]
    backup_id: Option<String>,

    #[arg(long, help = "Run timestamp (YYYYMMDD_HHMMSS); lists available runs when omitted")]
    timestamp: Option<String>,

    #[arg(long, env = "TIDEVAULT_PASSWORD", hide_env_values = true, help = "Archive password")]
    password: Option<String>,
}

impl RestoreCommand {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let archive_dir = self
            .from
            .clone()
            .unwrap_or_else(|| config.backup.output_dir.clone());
        if archive_dir.as_os_str().is_empty() {
            return Err(anyhow!("Archive directory required (--from or backup.output_dir)"));
        }

        let backup_id = match &self.backup_id {
            Some(id) => id.clone(),
            None => backup_id_for(&config.backup.root_dir)
                .map_err(|_| anyhow!("Backup ID required (--backup-id or backup.root_dir)"))?,
        };

        let password = if self.timestamp.is_some() {
            self.password(config)
        } else {
            None
        };

        let request = RestoreRequest {
            archive_dir,
            output_dir: self.to.clone(),
            backup_id,
            password,
            timestamp: self.timestamp.clone(),
        };

        info!("Restoring {} from {}", request.backup_id, request.archive_dir.display());

        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("Extracting into {}", request.output_dir.display()));

        let outcome = restore::restore(request).await;
        pb.finish_and_clear();

        match outcome? {
            RestoreOutcome::SelectionRequired(groups) => {
                println!("Available backups (newest first):");
                for group in &groups {
                    println!("  {}  ({} parts)", group.timestamp, group.parts);
                }
                println!("Re-run with --timestamp <TIMESTAMP> to restore one of them");
            }
            RestoreOutcome::Restored(summary) => {
                println!("Restored backup {}", summary.timestamp);
                println!("  Parts: {}", summary.parts);
                println!("  Files: {}", summary.files);
                println!("  Directories: {}", summary.directories);
                println!("  Target: {}", self.to.display());
            }
        }

        Ok(())
    }

    /// Flag or env first, then the config file, then an interactive prompt.
    /// An empty answer means the archive is unencrypted.
    fn password(&self, config: &AppConfig) -> Option<String> {
        self.password
            .clone()
            .or_else(|| config.backup.password.clone())
            .or_else(|| {
                print!("Enter archive password (empty for none): ");
                io::stdout().flush().ok()?;
                rpassword::read_password().ok()
            })
            .filter(|p| !p.is_empty())
    }
}
