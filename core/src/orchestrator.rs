use crate::archive::{ArchiveBuilder, ArchiveSettings, FinishedPart, DEFAULT_PART_CEILING, DEFAULT_WORKERS};
use crate::ledger::RecordStore;
use crate::pool::BufferPool;
use crate::scan::{resolve_changes, TreeSnapshot};
use crate::types::{backup_id_for, BackupId, PART_TIMESTAMP_FORMAT};
use crate::upload::PartUploader;
use crate::{Error, Result};
use chrono::Local;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub source_dir: PathBuf,
    pub output_dir: PathBuf,
    pub password: Option<String>,
    pub force_full: bool,
    pub part_ceiling: u64,
    pub workers: usize,
}

impl BackupConfig {
    pub fn new(source_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            source_dir: source_dir.into(),
            output_dir: output_dir.into(),
            password: None,
            force_full: false,
            part_ceiling: DEFAULT_PART_CEILING,
            workers: DEFAULT_WORKERS,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.source_dir.as_os_str().is_empty() {
            return Err(Error::Config("source directory is not set".to_string()));
        }
        if self.output_dir.as_os_str().is_empty() {
            return Err(Error::Config("output directory is not set".to_string()));
        }
        if self.part_ceiling == 0 {
            return Err(Error::Config("part size must be greater than zero".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub backup_id: BackupId,
    pub timestamp: String,
    pub files_archived: usize,
    pub parts: Vec<FinishedPart>,
    pub uploaded: usize,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    /// Nothing changed since the last successful run.
    NoChanges,
    Completed(RunReport),
}

/// Clears the run flag when the run ends, however it ends.
struct RunGuard<'a>(&'a AtomicBool);

impl<'a> RunGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| Error::AlreadyRunning)?;
        Ok(Self(flag))
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sequences scan, archive, upload and ledger commit for one source tree.
///
/// At most one run is active per job; a second request fails with
/// [`Error::AlreadyRunning`] instead of waiting.
pub struct BackupJob {
    config: BackupConfig,
    ledger: Arc<dyn RecordStore>,
    uploader: Option<Arc<dyn PartUploader>>,
    pool: Arc<BufferPool>,
    running: AtomicBool,
}

impl BackupJob {
    pub fn new(config: BackupConfig, ledger: Arc<dyn RecordStore>, pool: Arc<BufferPool>) -> Self {
        Self {
            config,
            ledger,
            uploader: None,
            pool,
            running: AtomicBool::new(false),
        }
    }

    pub fn with_uploader(mut self, uploader: Arc<dyn PartUploader>) -> Self {
        self.uploader = Some(uploader);
        self
    }

    pub fn config(&self) -> &BackupConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub async fn run(&self) -> Result<RunOutcome> {
        self.config.validate()?;
        let _guard = RunGuard::acquire(&self.running)?;

        let backup_id = backup_id_for(&self.config.source_dir)?;
        let force_full = self.config.force_full;
        info!(backup_id = %backup_id, source = %self.config.source_dir.display(), force_full, "Starting backup run");

        let source = self.config.source_dir.clone();
        let pool = self.pool.clone();
        let snapshot = tokio::task::spawn_blocking(move || TreeSnapshot::scan(&source, &pool))
            .await
            .map_err(|e| Error::Other(format!("scan task failed: {}", e)))??;

        let ledger = if force_full {
            Vec::new()
        } else {
            self.ledger.load_records(&backup_id).await?
        };
        let changes = resolve_changes(&snapshot, &ledger, force_full);
        if changes.is_empty() {
            info!(backup_id = %backup_id, files = snapshot.files.len(), "No changes detected");
            return Ok(RunOutcome::NoChanges);
        }
        let files_archived = changes.len();
        info!(
            backup_id = %backup_id,
            changed = files_archived,
            total = snapshot.files.len(),
            "Change set resolved"
        );

        tokio::fs::create_dir_all(&self.config.output_dir)
            .await
            .map_err(|e| Error::path(&self.config.output_dir, e))?;

        let timestamp = Local::now().format(PART_TIMESTAMP_FORMAT).to_string();
        let builder = ArchiveBuilder::new(
            ArchiveSettings {
                output_dir: self.config.output_dir.clone(),
                backup_id: backup_id.clone(),
                timestamp: timestamp.clone(),
                password: self.config.password.clone(),
                part_ceiling: self.config.part_ceiling,
                workers: self.config.workers,
            },
            self.config.source_dir.clone(),
            self.pool.clone(),
        );

        // Capacity 1 keeps at most one finished part waiting for upload.
        let (tx, mut rx) = mpsc::channel::<FinishedPart>(1);
        let empty_dirs = snapshot.empty_dirs.clone();
        let build = tokio::task::spawn_blocking(move || {
            builder.build(&changes, &empty_dirs, |part| {
                tx.blocking_send(part)
                    .map_err(|_| Error::Other("upload stage stopped".to_string()))
            })
        });

        let mut uploaded = 0;
        let mut upload_error = None;
        while let Some(part) = rx.recv().await {
            let Some(uploader) = &self.uploader else {
                continue;
            };
            match uploader.upload_part(&part.path).await {
                Ok(()) => {
                    uploaded += 1;
                    info!(part = part.index, path = %part.path.display(), "Part uploaded");
                    if let Err(e) = tokio::fs::remove_file(&part.path).await {
                        warn!(path = %part.path.display(), error = %e, "Failed to delete uploaded part");
                    }
                }
                Err(e) => {
                    upload_error = Some(e);
                    break;
                }
            }
        }
        drop(rx);

        let built = build
            .await
            .map_err(|e| Error::Other(format!("archive task failed: {}", e)))?;
        if let Some(e) = upload_error {
            warn!(backup_id = %backup_id, error = %e, "Upload failed, ledger left unchanged");
            return Err(e);
        }
        let parts = built?;

        let records = snapshot.to_records(&backup_id);
        debug!(backup_id = %backup_id, records = records.len(), "Committing ledger");
        self.ledger.replace_records(&backup_id, records).await?;

        info!(
            backup_id = %backup_id,
            timestamp = %timestamp,
            files = files_archived,
            parts = parts.len(),
            uploaded,
            "Backup run complete"
        );

        Ok(RunOutcome::Completed(RunReport {
            backup_id,
            timestamp,
            files_archived,
            parts,
            uploaded,
        }))
    }
}
