//! Thread isolation: the worker runs on a dedicated OS thread inside the
//! daemon process.
//!
//! A thread cannot be killed from the outside. On timeout the unit raises
//! the worker's cancel flag, which the renderer honours by killing its own
//! child, and then abandons the thread. Prefer process isolation when
//! renderers may hang without checking the flag.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::error::ExecutorError;
use crate::executor::{Launcher, RunningUnit};
use crate::jobs::Job;
use crate::render::CancelFlag;
use crate::worker::{ResultCode, Worker};

#[derive(Clone)]
pub struct ThreadLauncher {
    worker: Arc<Worker>,
    interrupt: Option<CancelFlag>,
}

impl ThreadLauncher {
    pub fn new(worker: Arc<Worker>) -> Self {
        Self {
            worker,
            interrupt: None,
        }
    }

    /// Every launched worker observes `flag`, so raising it interrupts all
    /// of them. Used by the standalone renderer to honour ^C.
    pub fn with_interrupt(mut self, flag: CancelFlag) -> Self {
        self.interrupt = Some(flag);
        self
    }
}

impl Launcher for ThreadLauncher {
    type Unit = ThreadUnit;

    fn launch(&self, job: &Job, scratch_prefix: &Path) -> Result<ThreadUnit, ExecutorError> {
        let (tx, rx) = oneshot::channel();
        let cancel = self.interrupt.clone().unwrap_or_default();

        let worker = self.worker.clone();
        let job = job.clone();
        let scratch = scratch_prefix.to_path_buf();
        let flag = cancel.clone();
        std::thread::Builder::new()
            .name(format!("render-{}", job.id))
            .spawn(move || {
                let result = worker.run(&job, &scratch, &flag);
                // The receiver is gone when the supervisor gave up on us.
                let _ = tx.send(result);
            })
            .map_err(ExecutorError::LaunchThread)?;

        Ok(ThreadUnit { rx, cancel })
    }
}

pub struct ThreadUnit {
    rx: oneshot::Receiver<ResultCode>,
    cancel: CancelFlag,
}

#[async_trait]
impl RunningUnit for ThreadUnit {
    async fn wait(&mut self) -> ResultCode {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => {
                error!("Worker thread exited without a result");
                ResultCode::RenderingFailed
            }
        }
    }

    async fn terminate(&mut self) {
        self.cancel.cancel();
        warn!("Worker thread cannot be killed, cancelled and abandoned");
    }
}
