use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;

use crate::config::{LayoutConfig, RendererConfig};
use crate::render::{
    CancelFlag, LayoutCapabilities, RenderError, RenderOutput, RenderRequest, Renderer,
};

/// Exit status the renderer uses for bad input (unknown area, empty data).
const PREPARATION_EXIT_CODE: i32 = 2;

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Longest stderr excerpt kept in an error message.
const STDERR_TAIL: usize = 2000;

/// Runs an external renderer program per job.
///
/// The request goes to the program's stdin as JSON. On success the program
/// may print a [`RenderOutput`] JSON object on stdout. Exit status 0 means
/// success, 2 a preparation failure, anything else a rendering failure.
pub struct CommandRenderer {
    program: String,
    args: Vec<String>,
    layouts: BTreeMap<String, LayoutConfig>,
}

impl CommandRenderer {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            layouts: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &RendererConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
            layouts: config.layouts.clone(),
        }
    }

    pub fn with_layout(mut self, name: impl Into<String>, layout: LayoutConfig) -> Self {
        self.layouts.insert(name.into(), layout);
        self
    }

    fn spawn(&self, request: &RenderRequest) -> Result<Child, RenderError> {
        let payload = serde_json::to_vec(request)
            .map_err(|e| RenderError::Preparation(format!("cannot encode request: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .spawn()
            .map_err(|e| {
                RenderError::Rendering(format!("cannot start '{}': {}", self.program, e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A renderer that exits without reading its input is judged by its
            // exit status, not by the broken pipe.
            if let Err(e) = stdin.write_all(&payload) {
                log::debug!("Renderer closed stdin early: {}", e);
            }
        }

        Ok(child)
    }
}

/// Kills the renderer together with anything it started. The renderer
/// leads its own process group.
fn kill_tree(child: &mut Child) {
    match killpg(Pid::from_raw(child.id() as i32), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => log::warn!("Could not kill renderer process group: {}", e),
    }
    let _ = child.kill();
}

fn drain<R: Read + Send + 'static>(source: Option<R>) -> JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        if let Some(mut source) = source {
            let _ = source.read_to_string(&mut buf);
        }
        buf
    })
}

fn tail(text: &str) -> &str {
    let text = text.trim();
    if text.len() <= STDERR_TAIL {
        return text;
    }
    let mut start = text.len() - STDERR_TAIL;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}

fn describe(status: ExitStatus, stderr: &str) -> String {
    let stderr = tail(stderr);
    if stderr.is_empty() {
        format!("renderer exited with {}", status)
    } else {
        format!("renderer exited with {}: {}", status, stderr)
    }
}

impl Renderer for CommandRenderer {
    fn capabilities(&self, layout: &str) -> Option<LayoutCapabilities> {
        self.layouts.get(layout).map(|l| LayoutCapabilities {
            formats: l.formats.clone(),
            paper_sizes: l.paper_sizes.clone(),
            multi_page: l.multi_page,
        })
    }

    fn render(
        &self,
        request: &RenderRequest,
        cancel: &CancelFlag,
    ) -> Result<RenderOutput, RenderError> {
        let mut child = self.spawn(request)?;
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = loop {
            if cancel.is_cancelled() {
                kill_tree(&mut child);
                let _ = child.wait();
                return Err(RenderError::Interrupted);
            }
            match child.try_wait() {
                Ok(Some(status)) => break status,
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => {
                    kill_tree(&mut child);
                    return Err(RenderError::Rendering(format!(
                        "lost track of renderer: {}",
                        e
                    )));
                }
            }
        };

        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();

        match status.code() {
            Some(0) => {
                let output = if stdout.trim().is_empty() {
                    RenderOutput::default()
                } else {
                    serde_json::from_str(stdout.trim()).unwrap_or_else(|e| {
                        log::warn!("Ignoring unreadable renderer output: {}", e);
                        RenderOutput::default()
                    })
                };
                Ok(output)
            }
            Some(PREPARATION_EXIT_CODE) => Err(RenderError::Preparation(describe(status, &stderr))),
            _ => Err(RenderError::Rendering(describe(status, &stderr))),
        }
    }
}
