use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO error at {path}: {source}")]
    Path {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("A backup run is already in progress")]
    AlreadyRunning,

    #[error("Archive error: {0}")]
    Archive(String),

    #[error("Failed to extract part {part}: {message}")]
    PartFailed { part: String, message: String },

    #[error("No backup parts found for {backup_id} in {dir}")]
    NoBackups { backup_id: String, dir: PathBuf },

    #[error("No backup taken at {timestamp}")]
    BackupNotFound { timestamp: String },

    #[error("Transport error during {context}: {message}")]
    Transport { context: String, message: String },

    #[error("Unexpected HTTP status {status} during {context}: {body}")]
    UnexpectedStatus {
        context: String,
        status: u16,
        body: String,
    },

    #[error("Chunk at offset {offset} rejected with status {status}: {body}")]
    ChunkRejected { offset: u64, status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authorization error: {0}")]
    Auth(String),

    #[error("Invalid schedule: {0}")]
    Schedule(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Wraps an I/O error with the path it happened on.
    pub fn path(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        Error::Path {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }
}

impl From<zip::result::ZipError> for Error {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::Io(e) => Error::Io(e),
            other => Error::Archive(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
