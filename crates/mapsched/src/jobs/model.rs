use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::sanitize::computize_title;

pub type JobId = i64;

/// Result message recorded for a successful rendering.
pub const RESULT_OK: &str = "ok";

/// Result message recorded when a waiting job is cancelled.
pub const RESULT_CANCELLED: &str = "rendering cancelled";

/// Lifecycle state of a job. The discriminants are the persisted codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Submitted = 0,
    InProgress = 1,
    Done = 2,
    DoneNoFiles = 3,
    Cancelled = 4,
}

impl JobStatus {
    pub fn code(self) -> i64 {
        self as i64
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Submitted),
            1 => Some(Self::InProgress),
            2 => Some(Self::Done),
            3 => Some(Self::DoneNoFiles),
            4 => Some(Self::Cancelled),
            _ => None,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Submitted => "Submitted",
            Self::InProgress => "In progress",
            Self::Done => "Done",
            Self::DoneNoFiles => "Done w/o files",
            Self::Cancelled => "Cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Geographic rectangle, upper-left and bottom-right corners in WGS84 degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub lat_upper_left: f64,
    pub lon_upper_left: f64,
    pub lat_bottom_right: f64,
    pub lon_bottom_right: f64,
}

/// What to render: an explicit rectangle or an administrative boundary that
/// must be resolved through the geocoder first.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RenderArea {
    BoundingBox(BoundingBox),
    Administrative { city: String, osm_id: i64 },
}

/// Rendering parameters. The scheduler never interprets them beyond the
/// title (for the files prefix) and the area (for geocoding).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderParams {
    pub title: String,
    pub area: RenderArea,
    pub stylesheet: String,
    pub layout: String,
    pub paper_width_mm: u32,
    pub paper_height_mm: u32,
    pub locale: String,
}

/// A job as submitted, before the store assigns an id.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub params: RenderParams,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    pub params: RenderParams,
    pub submitted_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub result_message: Option<String>,
    pub queue_index_at_submission: u32,
}

impl Job {
    /// Filename stem shared by every output file of this job:
    /// `{id:06}_{start:%Y-%m-%d_%H-%M}_{title}`.
    ///
    /// `None` until rendering has started, since the stem embeds the start time.
    pub fn files_prefix(&self) -> Option<String> {
        self.started_at.map(|started| {
            format!(
                "{:06}_{}_{}",
                self.id,
                started.format("%Y-%m-%d_%H-%M"),
                computize_title(&self.params.title)
            )
        })
    }

    fn is_ok(&self) -> bool {
        self.result_message.as_deref() == Some(RESULT_OK)
    }

    pub fn is_waiting(&self) -> bool {
        self.status == JobStatus::Submitted
    }

    pub fn is_rendering(&self) -> bool {
        self.status == JobStatus::InProgress
    }

    pub fn needs_waiting(&self) -> bool {
        self.is_waiting() || self.is_rendering()
    }

    pub fn is_done(&self) -> bool {
        self.status == JobStatus::Done
    }

    pub fn is_done_ok(&self) -> bool {
        self.is_done() && self.is_ok()
    }

    pub fn is_done_failed(&self) -> bool {
        self.is_done() && !self.is_ok()
    }

    pub fn is_obsolete(&self) -> bool {
        self.status == JobStatus::DoneNoFiles
    }

    pub fn is_obsolete_ok(&self) -> bool {
        self.is_obsolete() && self.is_ok()
    }

    pub fn is_obsolete_failed(&self) -> bool {
        self.is_obsolete() && !self.is_ok()
    }

    pub fn is_cancelled(&self) -> bool {
        self.status == JobStatus::Cancelled
    }

    /// Wall time between start and end of rendering, once both are known.
    pub fn rendering_duration(&self) -> Option<Duration> {
        match (self.started_at, self.finished_at) {
            (Some(start), Some(end)) => Some(end - start),
            _ => None,
        }
    }

    /// Extrapolates when this waiting job will start from how fast the queue
    /// moved since submission. `position` is the job's current queue position.
    pub fn estimated_start_time(&self, position: u64, now: DateTime<Utc>) -> DateTime<Utc> {
        let waited = now - self.submitted_at;
        let progression = i64::from(self.queue_index_at_submission) - position as i64;
        if progression <= 0 {
            return now;
        }
        let mean_step = waited / progression as i32;
        now + mean_step * position as i32
    }
}
