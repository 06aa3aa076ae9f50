use crate::commands::{backup_job, credential_manager, stdin_auth_events};
use crate::config::AppConfig;
use anyhow::Result;
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;
use tidevault_core::RunOutcome;
use tracing::info;

#[derive(Args)]
pub struct BackupCommand {
    #[arg(long, help = "Archive every file, ignoring the ledger")]
    force_full: bool,

    #[arg(long, help = "Keep parts locally instead of uploading them")]
    no_upload: bool,
}

impl BackupCommand {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let credentials = if config.upload_enabled() && !self.no_upload {
            let manager = credential_manager(config)?;
            let mut events = stdin_auth_events();
            manager.ensure_authorized(&mut events, config.auth_timeout()).await?;
            Some(manager)
        } else {
            info!("Upload disabled, parts stay in {}", config.backup.output_dir.display());
            None
        };

        let job = backup_job(config, self.force_full, credentials)?;

        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed_precise}] {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(120));
        pb.set_message(format!("Backing up {}", config.backup.root_dir.display()));

        let outcome = job.run().await;
        pb.finish_and_clear();

        match outcome? {
            RunOutcome::NoChanges => println!("No changes since the last backup"),
            RunOutcome::Completed(report) => {
                println!("Backup {} complete", report.timestamp);
                println!("  Files archived: {}", report.files_archived);
                println!("  Parts: {}", report.parts.len());
                if report.uploaded > 0 {
                    println!("  Uploaded: {}", report.uploaded);
                } else {
                    for part in &report.parts {
                        println!("  {}", part.path.display());
                    }
                }
            }
        }

        Ok(())
    }
}
