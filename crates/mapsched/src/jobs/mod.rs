//! Persistent job records and the contract the scheduler relies on.

pub mod model;
pub mod sqlite_store;

use std::path::PathBuf;

pub use model::{
    BoundingBox, Job, JobId, JobStatus, NewJob, RenderArea, RenderParams, RESULT_CANCELLED,
    RESULT_OK,
};
pub use sqlite_store::SqliteJobStore;

use crate::error::StoreError;
use crate::storage::{OutputFiles, OutputStorage};

/// Concurrency-safe access to job records.
///
/// Every status change goes through a conditional update, so two callers
/// racing on the same job never both win.
pub trait JobStore: Send + Sync {
    /// The output directory the store's jobs render into.
    fn storage(&self) -> &OutputStorage;

    /// Creates a `Submitted` job, snapshotting its queue position.
    fn submit(&self, new_job: NewJob) -> Result<Job, StoreError>;

    fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Oldest `Submitted` job by submission time.
    fn next_queued(&self) -> Result<Option<Job>, StoreError>;

    /// Claims a `Submitted` job: moves it to `InProgress` and stamps the
    /// start time. Returns `false` when another caller claimed or cancelled
    /// it first, in which case `job` is left unchanged.
    fn mark_started(&self, job: &mut Job) -> Result<bool, StoreError>;

    /// Moves an `InProgress` job to `Done` with the given result message.
    fn mark_finished(&self, job: &mut Job, result_message: &str) -> Result<bool, StoreError>;

    /// Cancels a `Submitted` job. Returns `false` if it was no longer waiting.
    fn mark_cancelled(&self, job: &mut Job) -> Result<bool, StoreError>;

    /// Puts every `InProgress` job back in the queue. Returns the count.
    fn reset_in_progress_to_submitted(&self) -> Result<usize, StoreError>;

    /// Maps a filename from the output directory back to its job. The id
    /// before the first `_` selects the candidate and the whole files
    /// prefix must match.
    fn find_by_output_filename(&self, name: &str) -> Result<Option<Job>, StoreError>;

    /// Removes the job's output files (thumbnail kept), demotes `Done` to
    /// `DoneNoFiles`, and returns `(removed_count, bytes_saved)`. Calling it
    /// again once the files are gone returns `(0, 0)`.
    fn delete_output_files(&self, job: &mut Job) -> Result<(usize, u64), StoreError>;

    /// Number of jobs waiting in the queue.
    fn queue_size(&self) -> Result<u64, StoreError>;

    /// 1-based position of a waiting job in the queue.
    fn queue_position(&self, job: &Job) -> Result<u64, StoreError>;

    fn all_jobs(&self) -> Result<Vec<Job>, StoreError>;

    /// Output files of `job` present on disk right now.
    fn output_files(&self, job: &Job) -> OutputFiles {
        job.files_prefix()
            .map(|prefix| self.storage().output_files(&prefix))
            .unwrap_or_default()
    }

    /// Whether a `Done` job still has any output file available.
    fn has_output_files(&self, job: &Job) -> bool {
        job.is_done() && !self.output_files(job).is_empty()
    }

    /// Path of the job's thumbnail, if one exists.
    fn thumbnail_path(&self, job: &Job) -> Option<PathBuf> {
        let path = self.storage().thumbnail_path(&job.files_prefix()?);
        path.is_file().then_some(path)
    }
}
