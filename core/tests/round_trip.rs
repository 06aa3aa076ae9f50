use filetime::FileTime;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use tidevault_core::{
    BackupConfig, BackupJob, BufferPool, Error, MemoryRecordStore, RestoreOutcome, RestoreRequest, RunOutcome,
    RunReport, restore,
};

// 2023-11-14 22:13:20 UTC, on an even second so ZIP timestamps keep it exactly.
const MTIME: i64 = 1_700_000_000;

struct Fixture {
    _tmp: TempDir,
    source: PathBuf,
    parts: PathBuf,
    restored: PathBuf,
}

fn write_file(root: &Path, rel: &str, contents: &[u8]) {
    let path = root.join(rel);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(&path, contents).unwrap();
    filetime::set_file_mtime(&path, FileTime::from_unix_time(MTIME, 0)).unwrap();
}

fn fixture() -> Fixture {
    let tmp = TempDir::new().unwrap();
    let source = tmp.path().join("photos");
    fs::create_dir_all(source.join("empty/inner")).unwrap();
    write_file(&source, "a.txt", b"hello world");
    write_file(&source, "2024/trip/b.jpg", &vec![0xAB; 20_000]);
    write_file(&source, "2024/notes.md", b"# notes\n");

    Fixture {
        parts: tmp.path().join("parts"),
        restored: tmp.path().join("restored"),
        source,
        _tmp: tmp,
    }
}

async fn backup(fx: &Fixture, password: Option<&str>) -> RunReport {
    let mut config = BackupConfig::new(&fx.source, &fx.parts);
    config.password = password.map(str::to_string);
    let job = BackupJob::new(config, Arc::new(MemoryRecordStore::new()), Arc::new(BufferPool::default()));

    match job.run().await.unwrap() {
        RunOutcome::Completed(report) => report,
        RunOutcome::NoChanges => panic!("first run must archive the tree"),
    }
}

fn request(fx: &Fixture, password: Option<&str>, timestamp: Option<&str>) -> RestoreRequest {
    RestoreRequest {
        archive_dir: fx.parts.clone(),
        output_dir: fx.restored.clone(),
        backup_id: "photos".to_string(),
        password: password.map(str::to_string),
        timestamp: timestamp.map(str::to_string),
    }
}

fn assert_restored(fx: &Fixture, rel: &str) {
    let original = fx.source.join(rel);
    let restored = fx.restored.join(rel);
    assert_eq!(fs::read(&original).unwrap(), fs::read(&restored).unwrap(), "{rel}");

    let mtime = FileTime::from_last_modification_time(&fs::metadata(&restored).unwrap());
    assert_eq!(mtime.unix_seconds(), MTIME, "{rel}");
}

#[tokio::test]
async fn test_encrypted_backup_restores_tree() {
    let fx = fixture();
    let report = backup(&fx, Some("s3cret")).await;
    assert_eq!(report.files_archived, 3);
    assert_eq!(report.uploaded, 0);
    assert_eq!(report.parts.len(), 1);

    let outcome = restore::restore(request(&fx, Some("s3cret"), Some(&report.timestamp)))
        .await
        .unwrap();
    let RestoreOutcome::Restored(summary) = outcome else {
        panic!("expected a restore");
    };
    assert_eq!(summary.files, 3);
    assert_eq!(summary.parts, 1);

    assert_restored(&fx, "a.txt");
    assert_restored(&fx, "2024/trip/b.jpg");
    assert_restored(&fx, "2024/notes.md");
    assert!(fx.restored.join("empty/inner").is_dir());
}

#[tokio::test]
async fn test_encrypted_backup_needs_password() {
    let fx = fixture();
    let report = backup(&fx, Some("s3cret")).await;

    let result = restore::restore(request(&fx, None, Some(&report.timestamp))).await;
    assert!(matches!(result, Err(Error::PartFailed { .. })));
}

#[tokio::test]
async fn test_restore_without_timestamp_lists_runs() {
    let fx = fixture();
    let report = backup(&fx, None).await;
    fs::write(fx.parts.join("photos_20000101_000000_part1.zip"), b"").unwrap();
    fs::write(fx.parts.join("photos_latest.zip"), b"").unwrap();

    let outcome = restore::restore(request(&fx, None, None)).await.unwrap();
    let RestoreOutcome::SelectionRequired(groups) = outcome else {
        panic!("expected a listing");
    };
    let timestamps: Vec<&str> = groups.iter().map(|g| g.timestamp.as_str()).collect();
    assert_eq!(timestamps, vec![report.timestamp.as_str(), "20000101_000000"]);
    assert!(!fx.restored.exists());
}

#[tokio::test]
async fn test_restore_unknown_timestamp_or_id() {
    let fx = fixture();
    backup(&fx, None).await;

    let result = restore::restore(request(&fx, None, Some("19990101_000000"))).await;
    assert!(matches!(result, Err(Error::BackupNotFound { .. })));

    let mut other = request(&fx, None, None);
    other.backup_id = "music".to_string();
    let result = restore::restore(other).await;
    assert!(matches!(result, Err(Error::NoBackups { .. })));
}

#[tokio::test]
async fn test_split_parts_restore_together() {
    let fx = fixture();
    let mut config = BackupConfig::new(&fx.source, &fx.parts);
    config.part_ceiling = 1_000;
    config.workers = 1;
    let job = BackupJob::new(config, Arc::new(MemoryRecordStore::new()), Arc::new(BufferPool::default()));

    let RunOutcome::Completed(report) = job.run().await.unwrap() else {
        panic!("first run must archive the tree");
    };
    assert_eq!(report.parts.len(), 3);

    let outcome = restore::restore(request(&fx, None, Some(&report.timestamp))).await.unwrap();
    let RestoreOutcome::Restored(summary) = outcome else {
        panic!("expected a restore");
    };
    assert_eq!(summary.parts, 3);
    assert_eq!(summary.files, 3);
    assert_restored(&fx, "2024/trip/b.jpg");
}
