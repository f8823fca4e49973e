use serde::Serialize;

use crate::jobs::RESULT_OK;

/// Exit status for a malformed command line.
pub const EXIT_USAGE: i32 = 3;

/// Exit status when the requested job does not exist.
pub const EXIT_NOT_FOUND: i32 = 4;

/// Outcome of one rendering attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCode {
    Success,
    Interrupted,
    PreparationFailed,
    RenderingFailed,
    /// Only ever produced by the supervisor, never by the worker itself.
    TimedOut,
}

impl ResultCode {
    /// Process exit status used by the `render` and `work` commands.
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Interrupted => 1,
            Self::PreparationFailed => 2,
            Self::RenderingFailed => 5,
            Self::TimedOut => 6,
        }
    }

    /// Maps a worker process exit status back to a result. Usage and
    /// not-found statuses, and anything unknown, count as rendering failures.
    pub fn from_exit_code(code: i32) -> Self {
        match code {
            0 => Self::Success,
            1 => Self::Interrupted,
            2 => Self::PreparationFailed,
            6 => Self::TimedOut,
            _ => Self::RenderingFailed,
        }
    }

    /// Message persisted on the job.
    pub fn message(self) -> &'static str {
        match self {
            Self::Success => RESULT_OK,
            Self::Interrupted => "rendering interrupted",
            Self::PreparationFailed => "data preparation failed",
            Self::RenderingFailed => "rendering failed",
            Self::TimedOut => "rendering took too long, canceled",
        }
    }

    pub fn is_success(self) -> bool {
        self == Self::Success
    }
}

impl std::fmt::Display for ResultCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.message())
    }
}
