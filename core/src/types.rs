use crate::{Error, Result};
use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::OnceLock;
use std::time::SystemTime;

/// Format of the run timestamp embedded in part file names.
pub const PART_TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

pub type BackupId = String;

/// Derives the backup ID for a source tree from the name of its root.
pub fn backup_id_for(source: &Path) -> Result<BackupId> {
    source
        .file_name()
        .map(|name| name.to_string_lossy().to_string())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            Error::Config(format!(
                "cannot derive a backup id from {}",
                source.display()
            ))
        })
}

/// The ledger's belief about one file as of the last successful run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    /// Source-relative path with forward slashes.
    pub path: String,
    pub mod_time: DateTime<Utc>,
    pub fingerprint: Option<String>,
    pub backup_id: BackupId,
}

/// Paths that need archiving in the current run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    paths: BTreeSet<String>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, path: impl Into<String>) {
        self.paths.insert(path.into());
    }

    pub fn contains(&self, path: &str) -> bool {
        self.paths.contains(path)
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &String> {
        self.paths.iter()
    }
}

impl FromIterator<String> for ChangeSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            paths: iter.into_iter().collect(),
        }
    }
}

/// Name of one physical part file: `{backup_id}_{yyyyMMdd_HHmmss}_part{N}.{ext}`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartName {
    pub backup_id: BackupId,
    pub timestamp: String,
    pub index: u32,
    pub extension: String,
}

impl PartName {
    pub fn new(backup_id: &str, timestamp: &str, index: u32, extension: &str) -> Self {
        Self {
            backup_id: backup_id.to_string(),
            timestamp: timestamp.to_string(),
            index,
            extension: extension.to_string(),
        }
    }

    pub fn file_name(&self) -> String {
        format!(
            "{}_{}_part{}.{}",
            self.backup_id, self.timestamp, self.index, self.extension
        )
    }

    /// Parses a file name against the strict part grammar for `backup_id`.
    ///
    /// Returns an error describing why the name does not match; callers
    /// scanning a directory treat that as a skip, not a failure.
    pub fn parse(backup_id: &str, file_name: &str) -> Result<Self> {
        let caps = part_pattern()?
            .captures(file_name)
            .filter(|caps| &caps[1] == backup_id)
            .ok_or_else(|| Error::Other(format!("'{}' does not match the part naming scheme", file_name)))?;

        let timestamp = format!("{}_{}", &caps[2], &caps[3]);
        NaiveDateTime::parse_from_str(&timestamp, PART_TIMESTAMP_FORMAT)
            .map_err(|e| Error::Other(format!("invalid timestamp {}: {}", timestamp, e)))?;

        let index: u32 = caps[4]
            .parse()
            .map_err(|e| Error::Other(format!("invalid part number {}: {}", &caps[4], e)))?;
        if index == 0 {
            return Err(Error::Other("part numbers start at 1".to_string()));
        }

        Ok(Self {
            backup_id: backup_id.to_string(),
            timestamp,
            index,
            extension: caps[5].to_string(),
        })
    }
}

/// Compiled once; the backup ID is checked against the first capture.
fn part_pattern() -> Result<&'static Regex> {
    static PATTERN: OnceLock<std::result::Result<Regex, String>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^(.+)_(\d{8})_(\d{6})_part(\d+)\.([A-Za-z0-9]+)$").map_err(|e| e.to_string())
        })
        .as_ref()
        .map_err(|e| Error::Other(e.clone()))
}

impl fmt::Display for PartName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

pub(crate) fn system_time_to_utc(time: SystemTime) -> DateTime<Utc> {
    time.into()
}
