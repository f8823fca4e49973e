pub mod config;
pub mod daemon;
pub mod db;
pub mod dbck;
pub mod error;
pub mod executor;
pub mod gc;
pub mod jobs;
pub mod notify;
pub mod render;
pub mod sanitize;
pub mod storage;
pub mod worker;

pub use config::{load_config, Config, Isolation};
pub use daemon::{Daemon, DaemonReport, DaemonState, Dispatcher};
pub use db::Database;
pub use error::{
    ConfigError, ExecutorError, MapschedError, Result, StorageError, StoreError, WorkerError,
};
pub use executor::{
    ExecutionPolicy, ExecutorState, ProcessLauncher, SupervisedExecutor, ThreadLauncher,
};
pub use gc::{CollectionReport, GarbageCollector};
pub use jobs::{Job, JobId, JobStatus, JobStore, NewJob, SqliteJobStore};
pub use storage::OutputStorage;
pub use worker::{ResultCode, Worker};
