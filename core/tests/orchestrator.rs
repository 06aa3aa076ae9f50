use async_trait::async_trait;
use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tidevault_core::{
    BackgroundTask, BackupConfig, BackupJob, BufferPool, Error, MemoryRecordStore, PartUploader, RecordStore, Result,
    RunOutcome, Scheduler, ShutdownSignal,
};
use tokio::sync::Notify;

fn source_tree(tmp: &TempDir) -> PathBuf {
    let source = tmp.path().join("docs");
    fs::create_dir_all(source.join("sub")).unwrap();
    fs::write(source.join("a.txt"), b"alpha").unwrap();
    fs::write(source.join("sub/b.jpg"), vec![7u8; 4096]).unwrap();
    source
}

fn job(source: &Path, parts: &Path, ledger: Arc<MemoryRecordStore>) -> BackupJob {
    BackupJob::new(BackupConfig::new(source, parts), ledger, Arc::new(BufferPool::default()))
}

fn listing(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect(),
        Err(_) => Vec::new(),
    };
    names.sort();
    names
}

/// Records every part it sees, optionally failing.
#[derive(Default)]
struct RecordingUploader {
    seen: Mutex<Vec<PathBuf>>,
    fail: bool,
}

#[async_trait]
impl PartUploader for RecordingUploader {
    async fn upload_part(&self, path: &Path) -> Result<()> {
        assert!(path.exists(), "part must exist while uploading");
        self.seen.lock().unwrap().push(path.to_path_buf());
        if self.fail {
            return Err(Error::ChunkRejected {
                offset: 0,
                status: 503,
                body: "unavailable".to_string(),
            });
        }
        Ok(())
    }
}

/// Parks inside the upload until released.
#[derive(Default)]
struct GatedUploader {
    entered: Notify,
    release: Notify,
}

#[async_trait]
impl PartUploader for GatedUploader {
    async fn upload_part(&self, _path: &Path) -> Result<()> {
        self.entered.notify_one();
        self.release.notified().await;
        Ok(())
    }
}

/// Takes a while per part, like a chunk PUT on a slow link.
#[derive(Default)]
struct SlowUploader {
    entered: Notify,
    finished: AtomicBool,
}

#[async_trait]
impl PartUploader for SlowUploader {
    async fn upload_part(&self, _path: &Path) -> Result<()> {
        self.entered.notify_one();
        tokio::time::sleep(Duration::from_millis(1500)).await;
        self.finished.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let ledger = Arc::new(MemoryRecordStore::new());

    let result = job(Path::new(""), tmp.path(), ledger.clone()).run().await;
    assert!(matches!(result, Err(Error::Config(_))));

    let mut config = BackupConfig::new(source_tree(&tmp), tmp.path().join("parts"));
    config.part_ceiling = 0;
    let result = BackupJob::new(config, ledger, Arc::new(BufferPool::default())).run().await;
    assert!(matches!(result, Err(Error::Config(_))));
}

#[tokio::test]
async fn test_second_run_without_changes_does_nothing() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let ledger = Arc::new(MemoryRecordStore::new());
    let job = job(&source, &parts, ledger.clone());

    let RunOutcome::Completed(report) = job.run().await.unwrap() else {
        panic!("first run must archive the tree");
    };
    assert_eq!(report.backup_id, "docs");
    assert_eq!(report.files_archived, 2);
    assert_eq!(ledger.load_records("docs").await.unwrap().len(), 2);

    let before = listing(&parts);
    assert!(matches!(job.run().await.unwrap(), RunOutcome::NoChanges));
    assert_eq!(listing(&parts), before);
    assert!(!job.is_running());
}

#[tokio::test]
async fn test_only_changed_file_is_archived() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let ledger = Arc::new(MemoryRecordStore::new());
    let job = job(&source, &parts, ledger.clone());
    job.run().await.unwrap();

    fs::write(source.join("a.txt"), b"alpha, revised").unwrap();
    let later = FileTime::from_unix_time(FileTime::now().unix_seconds() + 60, 0);
    filetime::set_file_mtime(source.join("a.txt"), later).unwrap();

    let RunOutcome::Completed(report) = job.run().await.unwrap() else {
        panic!("edited file must be picked up");
    };
    assert_eq!(report.files_archived, 1);
    assert_eq!(report.parts[0].entries, 1);
}

#[tokio::test]
async fn test_uploaded_parts_are_deleted_locally() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let uploader = Arc::new(RecordingUploader::default());
    let job = job(&source, &parts, Arc::new(MemoryRecordStore::new())).with_uploader(uploader.clone());

    let RunOutcome::Completed(report) = job.run().await.unwrap() else {
        panic!("first run must archive the tree");
    };
    assert_eq!(report.uploaded, report.parts.len());
    assert_eq!(uploader.seen.lock().unwrap().len(), report.parts.len());
    assert!(listing(&parts).is_empty());
}

#[tokio::test]
async fn test_failed_upload_leaves_ledger_untouched() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let ledger = Arc::new(MemoryRecordStore::new());
    let uploader = Arc::new(RecordingUploader {
        fail: true,
        ..Default::default()
    });
    let job = job(&source, &parts, ledger.clone()).with_uploader(uploader.clone());

    let result = job.run().await;
    assert!(matches!(result, Err(Error::ChunkRejected { status: 503, .. })));
    assert!(ledger.load_records("docs").await.unwrap().is_empty());
    assert_eq!(uploader.seen.lock().unwrap().len(), 1);
    assert!(!job.is_running());

    // Everything is still pending next time.
    let retry = self::job(&source, &parts, ledger.clone());
    let RunOutcome::Completed(report) = retry.run().await.unwrap() else {
        panic!("files must still be pending");
    };
    assert_eq!(report.files_archived, 2);
}

#[tokio::test]
async fn test_concurrent_run_is_rejected() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let uploader = Arc::new(GatedUploader::default());
    let job = Arc::new(job(&source, &parts, Arc::new(MemoryRecordStore::new())).with_uploader(uploader.clone()));

    let first = {
        let job = job.clone();
        tokio::spawn(async move { job.run().await })
    };
    uploader.entered.notified().await;
    assert!(job.is_running());

    let before = listing(&parts);
    assert!(matches!(job.run().await, Err(Error::AlreadyRunning)));
    assert_eq!(listing(&parts), before);

    uploader.release.notify_one();
    let outcome = first.await.unwrap().unwrap();
    assert!(matches!(outcome, RunOutcome::Completed(_)));
    assert!(!job.is_running());
}

#[tokio::test]
async fn test_force_full_rearchives_everything() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let ledger = Arc::new(MemoryRecordStore::new());
    job(&source, &parts, ledger.clone()).run().await.unwrap();

    let mut config = BackupConfig::new(&source, &parts);
    config.force_full = true;
    let full = BackupJob::new(config, ledger, Arc::new(BufferPool::default()));
    let RunOutcome::Completed(report) = full.run().await.unwrap() else {
        panic!("force full must archive the tree");
    };
    assert_eq!(report.files_archived, 2);
}

#[tokio::test]
async fn test_shutdown_lets_scheduled_upload_finish() {
    let tmp = TempDir::new().unwrap();
    let source = source_tree(&tmp);
    let parts = tmp.path().join("parts");
    let uploader = Arc::new(SlowUploader::default());
    let job = Arc::new(job(&source, &parts, Arc::new(MemoryRecordStore::new())).with_uploader(uploader.clone()));

    let signal = ShutdownSignal::new();
    let scheduler = Scheduler::parse("* * * * * *").unwrap();
    let task = BackgroundTask::spawn("scheduler", scheduler.run(job.clone(), signal.subscribe()));

    tokio::time::timeout(Duration::from_secs(10), uploader.entered.notified())
        .await
        .expect("a scheduled run should reach the upload");
    signal.trigger();
    task.join().await;

    assert!(uploader.finished.load(Ordering::SeqCst));
    assert!(!job.is_running());
    assert!(listing(&parts).is_empty());
}
