use crate::pool::BufferPool;
use crate::types::{system_time_to_utc, ChangeSet, PartName};
use crate::{Error, Result};
use chrono::{DateTime, Datelike, Timelike, Utc};
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use zip::write::{FileOptions, SimpleFileOptions};
use zip::result::ZipError;
use zip::{AesMode, CompressionMethod, ZipWriter};

/// Uncompressed bytes a part may hold before the next file rolls over to a new part.
pub const DEFAULT_PART_CEILING: u64 = 1 << 30;

pub const DEFAULT_WORKERS: usize = 4;

pub const PART_EXTENSION: &str = "zip";

/// Extensions of formats that are already compressed and are stored as-is.
const STORED_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "webp", "heic", "mp3", "mp4", "m4a", "mkv", "mov", "avi", "zip",
    "rar", "7z", "gz", "bz2", "xz", "zst",
];

pub fn compression_for(path: &str) -> CompressionMethod {
    let ext = Path::new(path)
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase());

    match ext {
        Some(ext) if STORED_EXTENSIONS.contains(&ext.as_str()) => CompressionMethod::Stored,
        _ => CompressionMethod::Deflated,
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSettings {
    pub output_dir: PathBuf,
    pub backup_id: String,
    /// Run timestamp in `PART_TIMESTAMP_FORMAT`.
    pub timestamp: String,
    /// Entries are AES-256 encrypted when set.
    pub password: Option<String>,
    pub part_ceiling: u64,
    pub workers: usize,
}

/// A closed part file, ready for upload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishedPart {
    pub index: u32,
    pub path: PathBuf,
    pub entries: usize,
    pub uncompressed_bytes: u64,
}

struct SourceFile<'a> {
    rel: &'a str,
    path: PathBuf,
    file: File,
    size: u64,
    mod_time: DateTime<Utc>,
}

impl<'a> SourceFile<'a> {
    fn open(root: &Path, rel: &'a str) -> Result<Self> {
        let path = root.join(rel);
        let file = File::open(&path).map_err(|e| Error::path(&path, e))?;
        let metadata = file.metadata().map_err(|e| Error::path(&path, e))?;
        let mod_time = metadata
            .modified()
            .map(system_time_to_utc)
            .map_err(|e| Error::path(&path, e))?;

        Ok(Self {
            rel,
            path,
            size: metadata.len(),
            mod_time,
            file,
        })
    }
}

struct OpenPart {
    writer: ZipWriter<BufWriter<File>>,
    index: u32,
    path: PathBuf,
    entries: usize,
    bytes: u64,
}

/// Writer state shared by all workers. Only one worker touches it at a time.
struct PartState<F> {
    current: Option<OpenPart>,
    next_index: u32,
    aborted: bool,
    finished: Vec<FinishedPart>,
    on_part: F,
}

pub struct ArchiveBuilder {
    settings: ArchiveSettings,
    source_root: PathBuf,
    pool: Arc<BufferPool>,
}

impl ArchiveBuilder {
    pub fn new(settings: ArchiveSettings, source_root: PathBuf, pool: Arc<BufferPool>) -> Self {
        if settings.password.is_none() {
            warn!(backup_id = %settings.backup_id, "No archive password configured, parts will not be encrypted");
        }
        Self {
            settings,
            source_root,
            pool,
        }
    }

    /// Archives every path of `changes` into size-bounded parts.
    ///
    /// `on_part` is called once per part, in index order, right after the part
    /// is closed. An error from it aborts the build. `empty_dirs` are recorded
    /// as directory entries in part 1.
    ///
    /// Workers only overlap opening and stat-ing source files. Reading,
    /// compressing and writing an entry happen under the part lock, so entries
    /// go into the container one at a time.
    pub fn build<F>(&self, changes: &ChangeSet, empty_dirs: &[String], on_part: F) -> Result<Vec<FinishedPart>>
    where
        F: FnMut(FinishedPart) -> Result<()> + Send,
    {
        let paths: Vec<&String> = changes.iter().collect();
        if paths.is_empty() {
            return Ok(Vec::new());
        }

        let state = Mutex::new(PartState {
            current: None,
            next_index: 1,
            aborted: false,
            finished: Vec::new(),
            on_part,
        });
        let cursor = AtomicUsize::new(0);
        let failed = AtomicBool::new(false);
        let first_error: Mutex<Option<Error>> = Mutex::new(None);
        let workers = self.settings.workers.clamp(1, paths.len());

        debug!(files = paths.len(), workers, "Building archive parts");

        std::thread::scope(|scope| {
            for _ in 0..workers {
                scope.spawn(|| {
                    while !failed.load(Ordering::SeqCst) {
                        let i = cursor.fetch_add(1, Ordering::SeqCst);
                        let Some(rel) = paths.get(i) else {
                            break;
                        };
                        if let Err(e) = self.add_file(rel, empty_dirs, &state) {
                            failed.store(true, Ordering::SeqCst);
                            let mut slot = first_error.lock().unwrap_or_else(|p| p.into_inner());
                            if slot.is_none() {
                                *slot = Some(e);
                            }
                            break;
                        }
                    }
                });
            }
        });

        let mut state = state.into_inner().unwrap_or_else(|p| p.into_inner());
        let error = first_error.into_inner().unwrap_or_else(|p| p.into_inner());

        if let Some(e) = error {
            if let Some(open) = state.current.take() {
                drop(open.writer);
                discard_part(&open.path);
            }
            return Err(e);
        }

        self.close_current(&mut state)?;
        info!(
            backup_id = %self.settings.backup_id,
            parts = state.finished.len(),
            files = paths.len(),
            "Archive build complete"
        );
        Ok(state.finished)
    }

    fn add_file<F>(&self, rel: &str, empty_dirs: &[String], state: &Mutex<PartState<F>>) -> Result<()>
    where
        F: FnMut(FinishedPart) -> Result<()>,
    {
        let mut source = SourceFile::open(&self.source_root, rel)?;
        let mut buf = self.pool.checkout();

        let mut state = state.lock().unwrap_or_else(|p| p.into_inner());
        if state.aborted {
            return Ok(());
        }
        let result = self.write_entry(&mut state, &mut source, &mut buf, empty_dirs);
        if result.is_err() {
            state.aborted = true;
        }
        result
    }

    fn write_entry<F>(
        &self,
        state: &mut PartState<F>,
        source: &mut SourceFile<'_>,
        buf: &mut [u8],
        empty_dirs: &[String],
    ) -> Result<()>
    where
        F: FnMut(FinishedPart) -> Result<()>,
    {
        let rel = source.rel;
        let size = source.size;
        let needs_rollover = state
            .current
            .as_ref()
            .is_some_and(|part| part.entries > 0 && part.bytes + size > self.settings.part_ceiling);
        if needs_rollover {
            self.close_current(state)?;
        }
        if state.current.is_none() {
            let index = state.next_index;
            state.next_index += 1;
            state.current = Some(self.open_part(index, empty_dirs)?);
        }
        let Some(part) = state.current.as_mut() else {
            return Err(Error::Archive("no open part".to_string()));
        };

        let options = self
            .entry_options(compression_for(rel))
            .last_modified_time(zip_time(source.mod_time))
            .large_file(size >= u32::MAX as u64);
        part.writer
            .start_file(rel, options)
            .map_err(|e| part_error(&part.path, e))?;

        let mut written = 0u64;
        loop {
            let n = source
                .file
                .read(buf)
                .map_err(|e| Error::path(&source.path, e))?;
            if n == 0 {
                break;
            }
            part.writer
                .write_all(&buf[..n])
                .map_err(|e| Error::path(&part.path, e))?;
            written += n as u64;
        }

        part.entries += 1;
        part.bytes += written;
        debug!(path = rel, part = part.index, bytes = written, "Archived file");
        Ok(())
    }

    fn entry_options(&self, method: CompressionMethod) -> FileOptions<'_, ()> {
        let options = SimpleFileOptions::default().compression_method(method);
        match self.settings.password.as_deref() {
            Some(password) => options.with_aes_encryption(AesMode::Aes256, password),
            None => options,
        }
    }

    fn open_part(&self, index: u32, empty_dirs: &[String]) -> Result<OpenPart> {
        let name = PartName::new(
            &self.settings.backup_id,
            &self.settings.timestamp,
            index,
            PART_EXTENSION,
        );
        let path = self.settings.output_dir.join(name.file_name());
        let file = File::create(&path).map_err(|e| Error::path(&path, e))?;
        let mut writer = ZipWriter::new(BufWriter::new(file));

        if index == 1 {
            let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
            for dir in empty_dirs {
                writer
                    .add_directory(dir.as_str(), options)
                    .map_err(|e| part_error(&path, e))?;
            }
        }

        debug!(part = %name, "Opened part");
        Ok(OpenPart {
            writer,
            index,
            path,
            entries: 0,
            bytes: 0,
        })
    }

    fn close_current<F>(&self, state: &mut PartState<F>) -> Result<()>
    where
        F: FnMut(FinishedPart) -> Result<()>,
    {
        let Some(open) = state.current.take() else {
            return Ok(());
        };

        let finished = open
            .writer
            .finish()
            .map_err(|e| part_error(&open.path, e))
            .and_then(|mut inner| inner.flush().map_err(|e| Error::path(&open.path, e)));
        if let Err(e) = finished {
            discard_part(&open.path);
            return Err(e);
        }

        let part = FinishedPart {
            index: open.index,
            path: open.path,
            entries: open.entries,
            uncompressed_bytes: open.bytes,
        };
        info!(
            part = part.index,
            entries = part.entries,
            bytes = part.uncompressed_bytes,
            path = %part.path.display(),
            "Finalized part"
        );

        state.finished.push(part.clone());
        (state.on_part)(part)
    }
}

/// Container errors on a part file, tagged with that file.
fn part_error(path: &Path, e: ZipError) -> Error {
    match e {
        ZipError::Io(io) => Error::path(path, io),
        other => Error::Archive(format!("{}: {}", path.display(), other)),
    }
}

fn discard_part(path: &Path) {
    if let Err(e) = fs::remove_file(path) {
        warn!(path = %path.display(), error = %e, "Failed to remove partial part");
    }
}

/// Converts to the container's timestamp, which has two-second resolution and
/// cannot go below 1980.
fn zip_time(time: DateTime<Utc>) -> zip::DateTime {
    zip::DateTime::from_date_and_time(
        u16::try_from(time.year()).unwrap_or(1980),
        time.month() as u8,
        time.day() as u8,
        time.hour() as u8,
        time.minute() as u8,
        time.second() as u8,
    )
    .unwrap_or_default()
}
