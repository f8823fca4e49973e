//! Supervised execution of one job: start the worker as an independent
//! unit, wait up to a hard timeout, kill it and clean up if it overruns.

pub mod process;
pub mod thread;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::error::ExecutorError;
use crate::jobs::Job;
use crate::storage::OutputStorage;
use crate::worker::ResultCode;

pub use process::{ProcessLauncher, ProcessUnit};
pub use thread::{ThreadLauncher, ThreadUnit};

/// Default hard limit on one rendering.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(1200);

/// How a job gets executed. Selected once when the daemon is built.
#[async_trait]
pub trait ExecutionPolicy: Send + Sync {
    async fn run(&self, job: &Job) -> ResultCode;
}

/// A worker that has been started and can be waited on or killed.
#[async_trait]
pub trait RunningUnit: Send {
    /// Resolves once the worker has finished on its own.
    async fn wait(&mut self) -> ResultCode;

    /// Stops the worker without its cooperation, as far as the unit kind
    /// allows.
    async fn terminate(&mut self);
}

/// Starts workers as independently schedulable units.
pub trait Launcher: Send + Sync {
    type Unit: RunningUnit;

    fn launch(&self, job: &Job, scratch_prefix: &Path) -> Result<Self::Unit, ExecutorError>;
}

/// Lifecycle of one supervised execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Running,
    Finished(ResultCode),
    TimedOut,
}

/// Wraps a [`Launcher`] with a hard timeout and failure cleanup.
///
/// Every non-success outcome removes all files under the job's files
/// prefix, thumbnail included, so a failed job never leaves output behind.
pub struct SupervisedExecutor<L> {
    launcher: L,
    storage: OutputStorage,
    timeout: Duration,
    attempts: AtomicU64,
    span: Span,
}

impl<L: Launcher> SupervisedExecutor<L> {
    pub fn new(launcher: L, storage: OutputStorage, timeout: Duration, span: Span) -> Self {
        Self {
            launcher,
            storage,
            timeout,
            attempts: AtomicU64::new(0),
            span,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Temporary-file prefix unique to this attempt, even when the same
    /// job is rerun concurrently from several processes.
    fn scratch_prefix(&self, job: &Job) -> PathBuf {
        let attempt = self.attempts.fetch_add(1, Ordering::Relaxed);
        std::env::temp_dir().join(format!(
            "mapschedd_{}_{}_{}_",
            std::process::id(),
            job.id,
            attempt
        ))
    }

    /// Runs `job` through the full state machine and returns the final
    /// state, which is always `Finished` or `TimedOut`.
    pub async fn execute(&self, job: &Job) -> ExecutorState {
        let span = tracing::info_span!(parent: &self.span, "execute", job_id = job.id);
        self.supervise(job).instrument(span).await
    }

    async fn supervise(&self, job: &Job) -> ExecutorState {
        let mut state = ExecutorState::Idle;
        let scratch = self.scratch_prefix(job);

        let mut unit = match self.launcher.launch(job, &scratch) {
            Ok(unit) => unit,
            Err(e) => {
                error!(error = %e, "Could not start worker");
                state = ExecutorState::Finished(ResultCode::RenderingFailed);
                self.cleanup(job, state).await;
                return state;
            }
        };
        transition(&mut state, ExecutorState::Running);

        match tokio::time::timeout(self.timeout, unit.wait()).await {
            Ok(result) => transition(&mut state, ExecutorState::Finished(result)),
            Err(_) => {
                warn!(timeout_secs = self.timeout.as_secs(), "Worker overran its timeout, killing it");
                unit.terminate().await;
                transition(&mut state, ExecutorState::TimedOut);
            }
        }

        self.cleanup(job, state).await;
        state
    }

    async fn cleanup(&self, job: &Job, state: ExecutorState) {
        if result_of(state).is_success() {
            return;
        }
        let Some(prefix) = job.files_prefix() else {
            return;
        };
        let storage = self.storage.clone();
        match tokio::task::spawn_blocking(move || storage.purge_prefix(&prefix)).await {
            Ok(Ok(0)) => {}
            Ok(Ok(n)) => info!(removed = n, "Removed output of failed job"),
            Ok(Err(e)) => error!(error = %e, "Could not remove output of failed job"),
            Err(e) => error!(error = %e, "Cleanup task failed"),
        }
    }
}

fn transition(state: &mut ExecutorState, next: ExecutorState) {
    debug!(from = ?*state, to = ?next, "Executor state change");
    *state = next;
}

fn result_of(state: ExecutorState) -> ResultCode {
    match state {
        ExecutorState::Finished(result) => result,
        ExecutorState::TimedOut => ResultCode::TimedOut,
        // Not reachable from `execute`; treated as a failure to stay safe.
        ExecutorState::Idle | ExecutorState::Running => ResultCode::RenderingFailed,
    }
}

#[async_trait]
impl<L: Launcher> ExecutionPolicy for SupervisedExecutor<L> {
    async fn run(&self, job: &Job) -> ResultCode {
        result_of(self.execute(job).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use crate::jobs::{BoundingBox, JobStatus, RenderArea, RenderParams};
    use tempfile::TempDir;

    /// Unit that finishes after `delay` with `result`, unless terminated.
    struct FakeUnit {
        delay: Duration,
        result: ResultCode,
        terminated: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    #[async_trait]
    impl RunningUnit for FakeUnit {
        async fn wait(&mut self) -> ResultCode {
            tokio::time::sleep(self.delay).await;
            self.result
        }

        async fn terminate(&mut self) {
            self.terminated.store(true, Ordering::SeqCst);
        }
    }

    struct FakeLauncher {
        delay: Duration,
        result: ResultCode,
        fail_launch: bool,
        terminated: std::sync::Arc<std::sync::atomic::AtomicBool>,
    }

    impl FakeLauncher {
        fn new(delay: Duration, result: ResultCode) -> Self {
            Self {
                delay,
                result,
                fail_launch: false,
                terminated: Default::default(),
            }
        }
    }

    impl Launcher for FakeLauncher {
        type Unit = FakeUnit;

        fn launch(&self, _job: &Job, scratch: &Path) -> Result<FakeUnit, ExecutorError> {
            assert!(scratch.to_string_lossy().contains("mapschedd_"));
            if self.fail_launch {
                return Err(ExecutorError::LaunchThread(std::io::Error::other("no threads")));
            }
            Ok(FakeUnit {
                delay: self.delay,
                result: self.result,
                terminated: self.terminated.clone(),
            })
        }
    }

    fn started_job() -> Job {
        Job {
            id: 3,
            status: JobStatus::InProgress,
            params: RenderParams {
                title: "Nantes".into(),
                area: RenderArea::BoundingBox(BoundingBox {
                    lat_upper_left: 47.3,
                    lon_upper_left: -1.6,
                    lat_bottom_right: 47.1,
                    lon_bottom_right: -1.4,
                }),
                stylesheet: "default".into(),
                layout: "plain".into(),
                paper_width_mm: 210,
                paper_height_mm: 297,
                locale: "fr_FR.UTF-8".into(),
            },
            submitted_at: Utc::now(),
            started_at: Some(Utc::now()),
            finished_at: None,
            result_message: None,
            queue_index_at_submission: 1,
        }
    }

    fn seed_outputs(dir: &TempDir, job: &Job) {
        let prefix = job.files_prefix().unwrap();
        for suffix in [".png", ".pdf", "_small.png"] {
            std::fs::write(dir.path().join(format!("{}{}", prefix, suffix)), b"x").unwrap();
        }
    }

    fn executor(dir: &TempDir, launcher: FakeLauncher, timeout: Duration) -> SupervisedExecutor<FakeLauncher> {
        SupervisedExecutor::new(
            launcher,
            OutputStorage::new(dir.path(), vec!["png".into(), "pdf".into()]),
            timeout,
            Span::none(),
        )
    }

    #[tokio::test]
    async fn test_success_keeps_files() {
        let dir = TempDir::new().unwrap();
        let job = started_job();
        seed_outputs(&dir, &job);
        let exec = executor(
            &dir,
            FakeLauncher::new(Duration::from_millis(10), ResultCode::Success),
            Duration::from_secs(5),
        );

        assert_eq!(exec.execute(&job).await, ExecutorState::Finished(ResultCode::Success));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 3);
    }

    #[tokio::test]
    async fn test_failure_purges_files_including_thumbnail() {
        let dir = TempDir::new().unwrap();
        let job = started_job();
        seed_outputs(&dir, &job);
        let exec = executor(
            &dir,
            FakeLauncher::new(Duration::from_millis(10), ResultCode::RenderingFailed),
            Duration::from_secs(5),
        );

        assert_eq!(exec.run(&job).await, ResultCode::RenderingFailed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_terminates_and_purges() {
        let dir = TempDir::new().unwrap();
        let job = started_job();
        seed_outputs(&dir, &job);
        let launcher = FakeLauncher::new(Duration::from_secs(3600), ResultCode::Success);
        let terminated = launcher.terminated.clone();
        let exec = executor(&dir, launcher, Duration::from_millis(100));

        assert_eq!(exec.execute(&job).await, ExecutorState::TimedOut);
        assert!(terminated.load(Ordering::SeqCst));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn test_launch_failure_is_rendering_failure() {
        let dir = TempDir::new().unwrap();
        let job = started_job();
        seed_outputs(&dir, &job);
        let mut launcher = FakeLauncher::new(Duration::ZERO, ResultCode::Success);
        launcher.fail_launch = true;
        let exec = executor(&dir, launcher, Duration::from_secs(1));

        assert_eq!(exec.run(&job).await, ResultCode::RenderingFailed);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_scratch_prefixes_are_unique() {
        let dir = TempDir::new().unwrap();
        let exec = executor(
            &dir,
            FakeLauncher::new(Duration::ZERO, ResultCode::Success),
            DEFAULT_TIMEOUT,
        );
        let job = started_job();
        assert_ne!(exec.scratch_prefix(&job), exec.scratch_prefix(&job));
    }
}
