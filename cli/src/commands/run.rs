use crate::commands::{backup_job, credential_manager, stdin_auth_events};
use crate::config::AppConfig;
use anyhow::{Context, Result};
use clap::Args;
use std::sync::Arc;
use std::time::Duration;
use tidevault_backends::credentials::DEFAULT_REFRESH_INTERVAL;
use tidevault_core::{BackgroundTask, RunOutcome, Scheduler, ShutdownSignal};
use tracing::{error, info, warn};

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Args)]
pub struct RunCommand {
    #[arg(long, help = "Skip the backup normally taken at startup")]
    no_initial_run: bool,
}

impl RunCommand {
    pub async fn run(&self, config: &AppConfig) -> Result<()> {
        let shutdown = ShutdownSignal::new();
        // Auth helpers get a grace period; tasks that drive backup runs are
        // awaited until their upload is done.
        let mut tasks: Vec<BackgroundTask> = Vec::new();
        let mut runs: Vec<BackgroundTask> = Vec::new();

        let credentials = if config.upload_enabled() {
            let manager = credential_manager(config)?;
            let mut events = stdin_auth_events();
            manager
                .ensure_authorized(&mut events, config.auth_timeout())
                .await
                .context("Authorization failed")?;
            tasks.push(manager.spawn_listener(events, shutdown.subscribe()));
            tasks.push(manager.spawn_refresher(DEFAULT_REFRESH_INTERVAL, shutdown.subscribe()));
            Some(manager)
        } else {
            warn!("onedrive.client_id not set, parts will stay in {}", config.backup.output_dir.display());
            None
        };

        let job = Arc::new(backup_job(config, false, credentials)?);

        let scheduler = match config.backup.cron.as_deref().filter(|c| !c.trim().is_empty()) {
            Some(expression) => Some(Scheduler::parse(expression)?),
            None => None,
        };

        if !self.no_initial_run {
            let job = job.clone();
            runs.push(BackgroundTask::spawn("initial-backup", async move {
                match job.run().await {
                    Ok(RunOutcome::NoChanges) => info!("No changes since the last backup"),
                    Ok(RunOutcome::Completed(report)) => info!(
                        timestamp = %report.timestamp,
                        files = report.files_archived,
                        parts = report.parts.len(),
                        "Initial backup finished"
                    ),
                    Err(e) => error!(error = %e, "Initial backup failed"),
                }
            }));
        }

        match scheduler {
            Some(scheduler) => {
                runs.push(BackgroundTask::spawn("scheduler", scheduler.run(job.clone(), shutdown.subscribe())));
            }
            None => info!("No backup.cron configured, only startup and manual backups will run"),
        }

        info!("Service running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;

        info!("Shutting down");
        shutdown.trigger();
        if job.is_running() {
            info!("Waiting for the running backup to finish");
        }
        for run in runs {
            run.join().await;
        }
        for task in tasks {
            task.wait(SHUTDOWN_GRACE).await;
        }
        info!("Stopped");

        Ok(())
    }
}
