//! The long-running poll-and-dispatch loop.

pub mod dispatcher;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::error::StoreError;
use crate::jobs::{Job, JobStore};
use crate::worker::ResultCode;

pub use dispatcher::Dispatcher;

/// Default pause between two polls of an empty queue.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonState {
    Starting,
    Polling,
    Dispatching,
    Stopped,
}

/// What one daemon run did, returned once it stops.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DaemonReport {
    pub recovered: usize,
    pub jobs_run: usize,
}

pub struct Daemon {
    store: Arc<dyn JobStore>,
    dispatcher: Dispatcher,
    poll_interval: Duration,
    state: DaemonState,
    span: Span,
}

impl Daemon {
    pub fn new(
        store: Arc<dyn JobStore>,
        dispatcher: Dispatcher,
        poll_interval: Duration,
        span: Span,
    ) -> Self {
        Self {
            store,
            dispatcher,
            poll_interval,
            state: DaemonState::Starting,
            span,
        }
    }

    pub fn state(&self) -> DaemonState {
        self.state
    }

    fn set_state(&mut self, next: DaemonState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "Daemon state change");
            self.state = next;
        }
    }

    /// Puts jobs left `InProgress` by a previous instance back in the
    /// queue. Safe to call when nothing was orphaned.
    pub async fn recover(&self) -> Result<usize, StoreError> {
        let store = self.store.clone();
        let count = blocking(move || store.reset_in_progress_to_submitted()).await?;
        if count > 0 {
            warn!(count, "Recovered jobs left in progress by a previous daemon");
        } else {
            debug!("No orphaned jobs to recover");
        }
        Ok(count)
    }

    /// Runs until `shutdown` is cancelled or the job store fails. Executions
    /// in flight at shutdown are awaited, which the executor timeout bounds.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<DaemonReport, StoreError> {
        let span = self.span.clone();
        async move {
            info!(
                poll_interval_secs = self.poll_interval.as_secs(),
                workers = self.dispatcher.capacity(),
                "Daemon starting"
            );
            let mut report = DaemonReport {
                recovered: self.recover().await?,
                ..Default::default()
            };

            let outcome = self.poll_loop(&shutdown, &mut report).await;
            if let Err(e) = &outcome {
                error!(error = %e, "Daemon stopping on job store error");
            }

            if self.dispatcher.in_flight() > 0 {
                info!(in_flight = self.dispatcher.in_flight(), "Waiting for running jobs");
            }
            while let Some((job, result)) = self.dispatcher.join_next().await {
                report.jobs_run += 1;
                if let Err(e) = self.record(job, result).await {
                    error!(error = %e, "Could not record job result during shutdown");
                }
            }

            self.set_state(DaemonState::Stopped);
            info!(jobs_run = report.jobs_run, "Daemon stopped");
            outcome.map(|()| report)
        }
        .instrument(span)
        .await
    }

    async fn poll_loop(
        &mut self,
        shutdown: &CancellationToken,
        report: &mut DaemonReport,
    ) -> Result<(), StoreError> {
        loop {
            while let Some((job, result)) = self.dispatcher.try_join_next() {
                report.jobs_run += 1;
                self.record(job, result).await?;
            }
            if shutdown.is_cancelled() {
                return Ok(());
            }

            self.set_state(DaemonState::Polling);
            if self.dispatcher.has_capacity() {
                if let Some(job) = self.claim_next().await? {
                    self.start(job).await?;
                    continue;
                }
            }

            let busy = self.dispatcher.in_flight() > 0;
            let finished = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested");
                    return Ok(());
                }
                finished = self.dispatcher.join_next(), if busy => finished,
                _ = tokio::time::sleep(self.poll_interval) => None,
            };
            if let Some((job, result)) = finished {
                report.jobs_run += 1;
                self.record(job, result).await?;
            }
        }
    }

    /// Takes the oldest waiting job and marks it `InProgress`. A job that
    /// was cancelled or claimed elsewhere in between is skipped.
    async fn claim_next(&self) -> Result<Option<Job>, StoreError> {
        let store = self.store.clone();
        blocking(move || {
            while let Some(mut job) = store.next_queued()? {
                if store.mark_started(&mut job)? {
                    return Ok(Some(job));
                }
                debug!(job_id = job.id, "Job no longer waiting, skipped");
            }
            Ok(None)
        })
        .await
    }

    /// Hands a claimed job to the dispatcher. A refused claim is closed as
    /// a failed render so the row never stays `InProgress` without an
    /// execution behind it.
    async fn start(&mut self, job: Job) -> Result<(), StoreError> {
        self.set_state(DaemonState::Dispatching);
        info!(job_id = job.id, title = %job.params.title, "Rendering job");
        let claimed = job.clone();
        if let Err(e) = self.dispatcher.dispatch(job) {
            warn!(job_id = claimed.id, error = %e, "Claimed job not dispatched");
            self.record(claimed, ResultCode::RenderingFailed).await?;
        }
        Ok(())
    }

    async fn record(&self, mut job: Job, result: ResultCode) -> Result<(), StoreError> {
        if result.is_success() {
            info!(job_id = job.id, "Job finished");
        } else {
            warn!(job_id = job.id, result = %result, "Job failed");
        }
        let store = self.store.clone();
        blocking(move || store.mark_finished(&mut job, result.message()).map(|_| ())).await
    }
}

/// Runs a synchronous store call on the blocking pool, inside the caller's span.
pub(crate) async fn blocking<T, F>(f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> Result<T, StoreError> + Send + 'static,
    T: Send + 'static,
{
    let span = Span::current();
    tokio::task::spawn_blocking(move || span.in_scope(f))
        .await
        .unwrap_or_else(|e| Err(StoreError::Task(e.to_string())))
}
