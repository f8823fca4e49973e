use std::collections::HashSet;
use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, error};

use crate::error::ExecutorError;
use crate::executor::ExecutionPolicy;
use crate::jobs::{Job, JobId};
use crate::worker::ResultCode;

/// Runs claimed jobs through an [`ExecutionPolicy`] with bounded
/// concurrency. A capacity of 1 is the strictly serial policy.
pub struct Dispatcher {
    policy: Arc<dyn ExecutionPolicy>,
    capacity: usize,
    tasks: JoinSet<(Job, ResultCode)>,
    in_flight: HashSet<JobId>,
}

impl Dispatcher {
    pub fn new(policy: Arc<dyn ExecutionPolicy>, capacity: usize) -> Self {
        Self {
            policy,
            capacity: capacity.max(1),
            tasks: JoinSet::new(),
            in_flight: HashSet::new(),
        }
    }

    pub fn serial(policy: Arc<dyn ExecutionPolicy>) -> Self {
        Self::new(policy, 1)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    pub fn has_capacity(&self) -> bool {
        self.in_flight.len() < self.capacity
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.in_flight.contains(&id)
    }

    /// Starts executing `job`. Refuses a job id that is already in flight.
    pub fn dispatch(&mut self, job: Job) -> Result<(), ExecutorError> {
        if !self.in_flight.insert(job.id) {
            return Err(ExecutorError::AlreadyRunning(job.id));
        }
        debug!(job_id = job.id, in_flight = self.in_flight.len(), "Dispatching job");

        let policy = self.policy.clone();
        self.tasks.spawn(async move {
            // Inner task so a panicking policy still yields a result for
            // this job instead of losing track of it.
            let inner = {
                let job = job.clone();
                tokio::spawn(async move { policy.run(&job).await })
            };
            let result = match inner.await {
                Ok(result) => result,
                Err(e) => {
                    error!(job_id = job.id, error = %e, "Execution task failed");
                    ResultCode::RenderingFailed
                }
            };
            (job, result)
        });
        Ok(())
    }

    /// Waits for the next execution to finish. `None` when idle.
    pub async fn join_next(&mut self) -> Option<(Job, ResultCode)> {
        loop {
            match self.tasks.join_next().await? {
                Ok((job, result)) => {
                    self.in_flight.remove(&job.id);
                    return Some((job, result));
                }
                // Outer tasks never panic; only reachable on runtime shutdown.
                Err(e) => error!(error = %e, "Dispatcher task lost"),
            }
        }
    }

    /// Collects an already-finished execution without waiting.
    pub fn try_join_next(&mut self) -> Option<(Job, ResultCode)> {
        loop {
            match self.tasks.try_join_next()? {
                Ok((job, result)) => {
                    self.in_flight.remove(&job.id);
                    return Some((job, result));
                }
                Err(e) => error!(error = %e, "Dispatcher task lost"),
            }
        }
    }
}
