use crate::types::PartName;
use crate::{Error, Result};
use chrono::{NaiveDate, TimeZone, Utc};
use filetime::FileTime;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct RestoreRequest {
    /// Directory holding the part files.
    pub archive_dir: PathBuf,
    pub output_dir: PathBuf,
    pub backup_id: String,
    pub password: Option<String>,
    /// Run to restore; without it the available runs are listed instead.
    pub timestamp: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSummary {
    pub timestamp: String,
    pub parts: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreSummary {
    pub timestamp: String,
    pub parts: usize,
    pub files: usize,
    pub directories: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestoreOutcome {
    /// No timestamp was given. Runs are listed newest first.
    SelectionRequired(Vec<GroupSummary>),
    Restored(RestoreSummary),
}

/// Part files of `backup_id` in `dir`, grouped by run timestamp.
///
/// Names that do not follow the part grammar are skipped with a warning.
pub fn discover_groups(dir: &Path, backup_id: &str) -> Result<BTreeMap<String, Vec<(PartName, PathBuf)>>> {
    let prefix = format!("{}_", backup_id);
    let mut groups: BTreeMap<String, Vec<(PartName, PathBuf)>> = BTreeMap::new();

    for entry in fs::read_dir(dir).map_err(|e| Error::path(dir, e))? {
        let entry = entry.map_err(|e| Error::path(dir, e))?;
        let file_name = entry.file_name().to_string_lossy().to_string();
        if !file_name.starts_with(&prefix) {
            continue;
        }

        match PartName::parse(backup_id, &file_name) {
            Ok(name) => groups
                .entry(name.timestamp.clone())
                .or_default()
                .push((name, entry.path())),
            Err(e) => warn!(file = %file_name, error = %e, "Skipping unrecognized part file"),
        }
    }

    for parts in groups.values_mut() {
        parts.sort_by_key(|(name, _)| name.index);
    }

    Ok(groups)
}

pub async fn restore(request: RestoreRequest) -> Result<RestoreOutcome> {
    tokio::task::spawn_blocking(move || restore_blocking(&request))
        .await
        .map_err(|e| Error::Other(format!("restore task failed: {}", e)))?
}

pub fn restore_blocking(request: &RestoreRequest) -> Result<RestoreOutcome> {
    let groups = discover_groups(&request.archive_dir, &request.backup_id)?;
    if groups.is_empty() {
        return Err(Error::NoBackups {
            backup_id: request.backup_id.clone(),
            dir: request.archive_dir.clone(),
        });
    }

    let Some(timestamp) = request.timestamp.as_deref() else {
        let listing = groups
            .iter()
            .rev()
            .map(|(timestamp, parts)| GroupSummary {
                timestamp: timestamp.clone(),
                parts: parts.len(),
            })
            .collect();
        return Ok(RestoreOutcome::SelectionRequired(listing));
    };

    let parts = groups.get(timestamp).ok_or_else(|| Error::BackupNotFound {
        timestamp: timestamp.to_string(),
    })?;

    let expected: Vec<u32> = (1..=parts.len() as u32).collect();
    let found: Vec<u32> = parts.iter().map(|(name, _)| name.index).collect();
    if found != expected {
        warn!(timestamp, ?found, "Part sequence has gaps, restoring what is present");
    }

    fs::create_dir_all(&request.output_dir).map_err(|e| Error::path(&request.output_dir, e))?;

    let mut summary = RestoreSummary {
        timestamp: timestamp.to_string(),
        parts: parts.len(),
        files: 0,
        directories: 0,
    };

    for (name, path) in parts {
        let (files, directories) =
            extract_part(path, &request.output_dir, request.password.as_deref()).map_err(|e| {
                Error::PartFailed {
                    part: name.file_name(),
                    message: e.to_string(),
                }
            })?;
        summary.files += files;
        summary.directories += directories;
        info!(part = %name, files, directories, "Extracted part");
    }

    Ok(RestoreOutcome::Restored(summary))
}

fn extract_part(path: &Path, output: &Path, password: Option<&str>) -> Result<(usize, usize)> {
    let file = File::open(path).map_err(|e| Error::path(path, e))?;
    let mut archive = zip::ZipArchive::new(file)?;
    let mut files = 0;
    let mut directories = 0;

    for i in 0..archive.len() {
        let mut entry = match password {
            Some(password) => archive.by_index_decrypt(i, password.as_bytes())?,
            None => archive.by_index(i)?,
        };

        let Some(rel) = entry.enclosed_name() else {
            return Err(Error::Archive(format!("entry '{}' escapes the output directory", entry.name())));
        };
        let target = output.join(rel);

        if entry.is_dir() {
            fs::create_dir_all(&target).map_err(|e| Error::path(&target, e))?;
            directories += 1;
            continue;
        }

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|e| Error::path(parent, e))?;
        }
        let mut out = File::create(&target).map_err(|e| Error::path(&target, e))?;
        io::copy(&mut entry, &mut out).map_err(|e| Error::path(&target, e))?;
        drop(out);

        if let Some(modified) = entry.last_modified().and_then(file_time) {
            filetime::set_file_times(&target, modified, modified).map_err(|e| Error::path(&target, e))?;
        }
        debug!(path = %target.display(), "Restored file");
        files += 1;
    }

    Ok((files, directories))
}

/// Entry timestamps are written as UTC.
fn file_time(time: zip::DateTime) -> Option<FileTime> {
    let date = NaiveDate::from_ymd_opt(time.year() as i32, time.month() as u32, time.day() as u32)?;
    let naive = date.and_hms_opt(time.hour() as u32, time.minute() as u32, time.second() as u32)?;
    let utc = Utc.from_utc_datetime(&naive);
    Some(FileTime::from_unix_time(utc.timestamp(), 0))
}
