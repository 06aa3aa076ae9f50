use crate::fingerprint::fingerprint_file;
use crate::pool::BufferPool;
use crate::types::{system_time_to_utc, ChangeSet, FileRecord};
use crate::{Error, Result};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// System entries that are never backed up. Excluded directories are not descended into.
pub const EXCLUDED_NAMES: &[&str] = &["System Volume Information", "$RECYCLE.BIN", "lost+found"];

/// How far a modification time must advance on its own before a file counts as
/// changed, to absorb filesystem timestamp granularity.
pub fn mtime_tolerance() -> Duration {
    Duration::seconds(1)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    pub mod_time: DateTime<Utc>,
    pub size: u64,
    pub fingerprint: Option<String>,
}

/// Current state of a source tree.
#[derive(Debug, Clone, Default)]
pub struct TreeSnapshot {
    /// Regular files keyed by forward-slash relative path.
    pub files: BTreeMap<String, ScannedFile>,
    /// Directories with no visible children.
    pub empty_dirs: Vec<String>,
}

impl TreeSnapshot {
    /// Walks `root`, skipping hidden and excluded entries, and fingerprints every regular file.
    pub fn scan(root: &Path, pool: &BufferPool) -> Result<Self> {
        let mut files = BTreeMap::new();
        let mut dirs = BTreeSet::new();
        let mut non_empty = BTreeSet::new();

        let walker = WalkDir::new(root)
            .follow_links(false)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped(&entry.file_name().to_string_lossy()));

        for entry in walker {
            let entry = entry.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                match e.into_io_error() {
                    Some(io) => Error::path(path, io),
                    None => Error::Other(format!("filesystem loop at {}", path.display())),
                }
            })?;
            if entry.depth() == 0 {
                continue;
            }

            let rel = relative_key(root, entry.path())?;
            if let Some((parent, _)) = rel.rsplit_once('/') {
                non_empty.insert(parent.to_string());
            } else {
                non_empty.insert(String::new());
            }

            let file_type = entry.file_type();
            if file_type.is_dir() {
                dirs.insert(rel);
            } else if file_type.is_file() {
                let metadata = entry
                    .metadata()
                    .map_err(|e| Error::path(entry.path(), e.into()))?;
                let mod_time = metadata
                    .modified()
                    .map(system_time_to_utc)
                    .map_err(|e| Error::path(entry.path(), e))?;

                let fingerprint = match fingerprint_file(entry.path(), pool) {
                    Ok(hash) => Some(hash),
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "Fingerprinting failed, comparing by mtime only");
                        None
                    }
                };

                files.insert(
                    rel,
                    ScannedFile {
                        mod_time,
                        size: metadata.len(),
                        fingerprint,
                    },
                );
            } else {
                debug!(path = %entry.path().display(), "Skipping non-regular file");
            }
        }

        let empty_dirs = dirs.into_iter().filter(|d| !non_empty.contains(d)).collect();

        Ok(Self { files, empty_dirs })
    }

    /// Full ledger snapshot for this tree.
    pub fn to_records(&self, backup_id: &str) -> Vec<FileRecord> {
        self.files
            .iter()
            .map(|(path, file)| FileRecord {
                path: path.clone(),
                mod_time: file.mod_time,
                fingerprint: file.fingerprint.clone(),
                backup_id: backup_id.to_string(),
            })
            .collect()
    }

    pub fn total_size(&self) -> u64 {
        self.files.values().map(|f| f.size).sum()
    }
}

/// Compares the current tree against the ledger.
pub fn resolve_changes(snapshot: &TreeSnapshot, ledger: &[FileRecord], force_full: bool) -> ChangeSet {
    if force_full {
        return snapshot.files.keys().cloned().collect();
    }

    let previous: HashMap<&str, &FileRecord> = ledger.iter().map(|r| (r.path.as_str(), r)).collect();
    let mut changes = ChangeSet::new();

    for (path, file) in &snapshot.files {
        let Some(record) = previous.get(path.as_str()) else {
            debug!(path = %path, "New file");
            changes.insert(path.clone());
            continue;
        };

        if file.mod_time <= record.mod_time {
            continue;
        }

        let content_differs = matches!(
            (&file.fingerprint, &record.fingerprint),
            (Some(current), Some(last)) if current != last
        );
        if content_differs {
            debug!(path = %path, "Content changed");
            changes.insert(path.clone());
        } else if file.mod_time - record.mod_time > mtime_tolerance() {
            debug!(path = %path, "Modification time advanced");
            changes.insert(path.clone());
        }
    }

    // Deletions are noticed but not acted on; the ledger is replaced wholesale later.
    let removed = ledger
        .iter()
        .filter(|r| !snapshot.files.contains_key(&r.path))
        .count();
    if removed > 0 {
        debug!(removed, "Files present in the ledger are gone from the source tree");
    }

    changes
}

fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || EXCLUDED_NAMES.contains(&name)
}

fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let rel = path
        .strip_prefix(root)
        .map_err(|_| Error::Other(format!("{} is outside {}", path.display(), root.display())))?;
    Ok(rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}
