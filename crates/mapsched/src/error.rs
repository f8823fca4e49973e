use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MapschedError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job store error: {0}")]
    Store(#[from] StoreError),

    #[error("Worker error: {0}")]
    Worker(#[from] WorkerError),

    #[error("Executor error: {0}")]
    Executor(#[from] ExecutorError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Invalid layout '{name}': {reason}")]
    InvalidLayout { name: String, reason: String },

    #[error("No default location for '{0}' (home directory unknown)")]
    NoDefaultPath(&'static str),
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Output directory '{0}' does not exist or is not a directory")]
    InvalidOutputDirectory(PathBuf),

    #[error("Failed to list directory '{path}': {source}")]
    ReadDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stat '{path}': {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to remove '{path}': {source}")]
    RemoveFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a [`crate::jobs::JobStore`] implementation.
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Job #{0} not found")]
    NotFound(i64),

    #[error("Corrupt job row #{id}: {reason}")]
    CorruptRow { id: i64, reason: String },

    #[error("Blocking store task failed: {0}")]
    Task(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        StoreError::Database(crate::db::DatabaseError::Sqlite(err))
    }
}

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("Job #{0} has not started rendering, no files prefix available")]
    NotStarted(i64),
}

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("Failed to launch worker process '{program}': {source}")]
    LaunchProcess {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to launch worker thread: {0}")]
    LaunchThread(#[source] std::io::Error),

    #[error("Job #{0} is already being executed")]
    AlreadyRunning(i64),
}

pub type Result<T> = std::result::Result<T, MapschedError>;
