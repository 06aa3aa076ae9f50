pub mod archive;
pub mod error;
pub mod fingerprint;
pub mod ledger;
pub mod orchestrator;
pub mod pool;
pub mod restore;
pub mod scan;
pub mod schedule;
pub mod task;
pub mod types;
pub mod upload;

pub use archive::{ArchiveBuilder, ArchiveSettings, FinishedPart};
pub use error::{Error, Result};
pub use ledger::{JsonRecordStore, MemoryRecordStore, RecordStore};
pub use orchestrator::{BackupConfig, BackupJob, RunOutcome, RunReport};
pub use pool::BufferPool;
pub use restore::{RestoreOutcome, RestoreRequest, RestoreSummary};
pub use schedule::Scheduler;
pub use task::{BackgroundTask, ShutdownSignal};
pub use types::*;
pub use upload::PartUploader;
