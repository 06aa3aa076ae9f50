use crate::types::FileRecord;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const LEDGER_VERSION: u32 = 1;

/// Persistent per-file state from the last successful run of each backup ID.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Records for `backup_id`, ordered by path. Unknown IDs yield an empty list.
    async fn load_records(&self, backup_id: &str) -> Result<Vec<FileRecord>>;

    /// Replaces every record of `backup_id` with `records`.
    async fn replace_records(&self, backup_id: &str, records: Vec<FileRecord>) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerFile {
    version: u32,
    backup_id: String,
    records: Vec<FileRecord>,
}

/// One JSON document per backup ID under a state directory.
#[derive(Debug, Clone)]
pub struct JsonRecordStore {
    dir: PathBuf,
}

impl JsonRecordStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn ledger_path(&self, backup_id: &str) -> PathBuf {
        self.dir.join(format!("{}.ledger.json", backup_id))
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn load_records(&self, backup_id: &str) -> Result<Vec<FileRecord>> {
        let path = self.ledger_path(backup_id);
        let data = match fs::read(&path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(Error::path(&path, e)),
        };

        let ledger: LedgerFile = serde_json::from_slice(&data)?;
        if ledger.version != LEDGER_VERSION {
            return Err(Error::Other(format!(
                "unsupported ledger version {} in {}",
                ledger.version,
                path.display()
            )));
        }

        let mut records = ledger.records;
        records.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(records)
    }

    async fn replace_records(&self, backup_id: &str, mut records: Vec<FileRecord>) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::path(&self.dir, e))?;

        records.sort_by(|a, b| a.path.cmp(&b.path));
        let count = records.len();
        let ledger = LedgerFile {
            version: LEDGER_VERSION,
            backup_id: backup_id.to_string(),
            records,
        };
        let data = serde_json::to_vec_pretty(&ledger)?;

        // Write-then-rename so a crash never leaves a half-written ledger.
        let path = self.ledger_path(backup_id);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, data).await.map_err(|e| Error::path(&tmp, e))?;
        fs::rename(&tmp, &path).await.map_err(|e| Error::path(&path, e))?;

        debug!(backup_id, records = count, path = %path.display(), "Ledger replaced");
        Ok(())
    }
}

/// Ledger kept in memory, for tests and one-shot runs.
#[derive(Debug, Default)]
pub struct MemoryRecordStore {
    records: Mutex<HashMap<String, Vec<FileRecord>>>,
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn load_records(&self, backup_id: &str) -> Result<Vec<FileRecord>> {
        Ok(self
            .records
            .lock()
            .await
            .get(backup_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn replace_records(&self, backup_id: &str, mut records: Vec<FileRecord>) -> Result<()> {
        records.sort_by(|a, b| a.path.cmp(&b.path));
        self.records.lock().await.insert(backup_id.to_string(), records);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(path: &str, backup_id: &str) -> FileRecord {
        FileRecord {
            path: path.to_string(),
            mod_time: Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap(),
            fingerprint: Some("abc".to_string()),
            backup_id: backup_id.to_string(),
        }
    }

    #[tokio::test]
    async fn test_json_store_replace_and_load() {
        let dir = TempDir::new().unwrap();
        let store = JsonRecordStore::new(dir.path().join("state"));

        assert!(store.load_records("photos").await.unwrap().is_empty());

        store
            .replace_records("photos", vec![record("b.jpg", "photos"), record("a.txt", "photos")])
            .await
            .unwrap();
        let loaded = store.load_records("photos").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].path, "a.txt");

        store
            .replace_records("photos", vec![record("c.txt", "photos")])
            .await
            .unwrap();
        let loaded = store.load_records("photos").await.unwrap();
        assert_eq!(loaded, vec![record("c.txt", "photos")]);

        assert!(!dir.path().join("state/photos.ledger.json.tmp").exists());
    }

    #[tokio::test]
    async fn test_backup_ids_are_isolated() {
        let store = MemoryRecordStore::new();
        store
            .replace_records("docs", vec![record("x", "docs")])
            .await
            .unwrap();

        assert!(store.load_records("photos").await.unwrap().is_empty());
        assert_eq!(store.load_records("docs").await.unwrap().len(), 1);
    }
}
