//! Process isolation: every job runs in a fresh child process placed in
//! its own process group, so a timeout can kill the whole tree.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::error::ExecutorError;
use crate::executor::{Launcher, RunningUnit};
use crate::jobs::Job;
use crate::worker::ResultCode;

/// Starts `program <base_args> work <job id> --scratch-prefix <prefix>`.
///
/// The child reports its outcome through its exit status, see
/// [`ResultCode::exit_code`].
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    program: PathBuf,
    base_args: Vec<String>,
}

impl ProcessLauncher {
    pub fn new(program: impl Into<PathBuf>, base_args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            base_args,
        }
    }

    /// Arguments passed after `base_args` for one job.
    pub fn job_args(job: &Job, scratch_prefix: &Path) -> Vec<String> {
        vec![
            "work".to_string(),
            job.id.to_string(),
            "--scratch-prefix".to_string(),
            scratch_prefix.to_string_lossy().into_owned(),
        ]
    }
}

impl Launcher for ProcessLauncher {
    type Unit = ProcessUnit;

    fn launch(&self, job: &Job, scratch_prefix: &Path) -> Result<ProcessUnit, ExecutorError> {
        let child = Command::new(&self.program)
            .args(&self.base_args)
            .args(Self::job_args(job, scratch_prefix))
            .stdin(Stdio::null())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::LaunchProcess {
                program: self.program.clone(),
                source,
            })?;

        let pid = child.id().map(|id| id as i32);
        debug!(job_id = job.id, pid = ?pid, "Worker process started");
        Ok(ProcessUnit { child, pid })
    }
}

pub struct ProcessUnit {
    child: Child,
    pid: Option<i32>,
}

impl ProcessUnit {
    pub fn pid(&self) -> Option<i32> {
        self.pid
    }
}

#[async_trait]
impl RunningUnit for ProcessUnit {
    async fn wait(&mut self) -> ResultCode {
        match self.child.wait().await {
            Ok(status) => match status.code() {
                Some(code) => ResultCode::from_exit_code(code),
                None => {
                    warn!(status = %status, "Worker process killed by a signal");
                    ResultCode::RenderingFailed
                }
            },
            Err(e) => {
                warn!(error = %e, "Could not wait on worker process");
                ResultCode::RenderingFailed
            }
        }
    }

    async fn terminate(&mut self) {
        // The child leads its own group, so this reaches the renderer and
        // anything it spawned.
        if let Some(pid) = self.pid {
            match killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                Ok(()) | Err(Errno::ESRCH) => {}
                Err(e) => warn!(pid, error = %e, "Could not kill worker process group"),
            }
        }
        if let Err(e) = self.child.kill().await {
            debug!(error = %e, "Worker process already gone");
        }
    }
}
