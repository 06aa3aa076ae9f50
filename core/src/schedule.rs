use crate::orchestrator::{BackupJob, RunOutcome};
use crate::task::shutdown_requested;
use crate::{Error, Result};
use chrono::{DateTime, Local, TimeZone};
use cron::Schedule;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Fires backup runs on a cron expression evaluated in local time.
///
/// Accepts the classic five-field form (`min hour dom month dow`), the
/// seconds-first form and the `@daily` style shorthands.
#[derive(Debug, Clone)]
pub struct Scheduler {
    expression: String,
    schedule: Schedule,
}

impl Scheduler {
    pub fn parse(expression: &str) -> Result<Self> {
        let trimmed = expression.trim();
        if trimmed.is_empty() {
            return Err(Error::Schedule("empty cron expression".to_string()));
        }

        let fields: Vec<&str> = trimmed.split_whitespace().collect();
        let normalized = if !trimmed.starts_with('@') && fields.len() == 5 {
            let day_of_week = classic_day_of_week(fields[4])
                .map_err(|e| Error::Schedule(format!("'{}': {}", trimmed, e)))?;
            format!("0 {} {}", fields[..4].join(" "), day_of_week)
        } else {
            trimmed.to_string()
        };

        let schedule = Schedule::from_str(&normalized)
            .map_err(|e| Error::Schedule(format!("'{}': {}", trimmed, e)))?;

        Ok(Self {
            expression: trimmed.to_string(),
            schedule,
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    pub fn next_after<Tz: TimeZone>(&self, after: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        self.schedule.after(after).next()
    }

    /// Runs until shutdown, spawning `job` at every firing.
    ///
    /// Firings that land while a run is still active are rejected by the job
    /// itself and only logged. On shutdown no new run starts, and a run that
    /// is already going is awaited to completion, never cancelled.
    pub async fn run(self, job: Arc<BackupJob>, mut shutdown: watch::Receiver<bool>) {
        info!(cron = %self.expression, "Scheduler started");
        let mut runs = JoinSet::new();

        loop {
            while runs.try_join_next().is_some() {}

            let now = Local::now();
            let Some(next) = self.next_after(&now) else {
                warn!(cron = %self.expression, "Schedule has no upcoming firings");
                break;
            };
            let wait = (next - now).to_std().unwrap_or_default();
            info!(next = %next.format("%Y-%m-%d %H:%M:%S"), "Next scheduled backup");

            tokio::select! {
                _ = tokio::time::sleep(wait) => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            let job = job.clone();
            runs.spawn(async move {
                match job.run().await {
                    Ok(RunOutcome::NoChanges) => info!("Scheduled backup found nothing to do"),
                    Ok(RunOutcome::Completed(report)) => info!(
                        backup_id = %report.backup_id,
                        files = report.files_archived,
                        parts = report.parts.len(),
                        "Scheduled backup finished"
                    ),
                    Err(Error::AlreadyRunning) => {
                        warn!("Previous backup still running, skipping this firing")
                    }
                    Err(e) => error!(error = %e, "Scheduled backup failed"),
                }
            });
        }

        if !runs.is_empty() {
            info!(active = runs.len(), "Waiting for the running backup to finish");
        }
        while let Some(result) = runs.join_next().await {
            if let Err(e) = result {
                error!(error = %e, "Scheduled backup task ended abnormally");
            }
        }

        info!("Scheduler stopped");
    }
}

const DAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrites a classic day-of-week field (0-6 from Sunday, 7 also Sunday) as
/// day names, since the `cron` crate numbers days 1-7 from Sunday.
///
/// Fields without digits (`*`, `?`, `MON-FRI`) are returned unchanged.
fn classic_day_of_week(field: &str) -> std::result::Result<String, String> {
    if !field.bytes().any(|b| b.is_ascii_digit()) {
        return Ok(field.to_string());
    }

    let mut days = [false; 7];
    for item in field.split(',') {
        let (range, step) = match item.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| format!("invalid step in '{}'", item))?;
                if step == 0 {
                    return Err(format!("zero step in '{}'", item));
                }
                (range, step)
            }
            None => (item, 1),
        };

        let (first, last) = match range {
            "*" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (day_number(a)?, day_number(b)?),
                // `5/2` runs from 5 to the end of the week.
                None if item.contains('/') => (day_number(range)?, 6),
                None => {
                    let day = day_number(range)?;
                    (day, day)
                }
            },
        };
        if first > last {
            return Err(format!("descending range '{}'", range));
        }

        for day in (first..=last).step_by(step as usize) {
            days[(day % 7) as usize] = true;
        }
    }

    Ok(DAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, set)| *set)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

fn day_number(token: &str) -> std::result::Result<u32, String> {
    match token.parse::<u32>() {
        Ok(day) if day <= 7 => Ok(day),
        _ => Err(format!("invalid day of week '{}'", token)),
    }
}
