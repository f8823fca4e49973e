//! Test harness for isolated scheduler runs.
//!
//! `TestHarness` owns a temporary output directory and an in-memory job
//! database, and builds workers around fake collaborators so no external
//! renderer or network is needed.

#![allow(dead_code)]

use std::fs::File;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use tempfile::TempDir;
use tracing::Span;

use mapsched::config::PaperSize;
use mapsched::jobs::{BoundingBox, Job, JobStore, NewJob, RenderArea, RenderParams};
use mapsched::notify::Notifier;
use mapsched::render::{
    CancelFlag, GeocodeError, Geocoder, LayoutCapabilities, RenderError, RenderOutput,
    RenderRequest, Renderer, ThumbnailGenerator,
};
use mapsched::{Database, OutputStorage, SqliteJobStore, Worker};

pub const KIB: u64 = 1024;
pub const GIB: u64 = 1024 * 1024 * 1024;

/// How a [`FakeRenderer`] ends once its delay is over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    PreparationFailure,
    RenderingFailure,
}

/// Writes one file per requested format, waits `delay` while watching the
/// cancel flag, then ends with `outcome`.
pub struct FakeRenderer {
    pub delay: Duration,
    pub outcome: Outcome,
    pub calls: AtomicUsize,
}

impl FakeRenderer {
    pub fn new(outcome: Outcome) -> Self {
        Self::slow(outcome, Duration::ZERO)
    }

    pub fn slow(outcome: Outcome, delay: Duration) -> Self {
        Self {
            delay,
            outcome,
            calls: AtomicUsize::new(0),
        }
    }
}

impl Renderer for FakeRenderer {
    fn capabilities(&self, _layout: &str) -> Option<LayoutCapabilities> {
        Some(LayoutCapabilities {
            formats: vec!["png".into(), "pdf".into()],
            paper_sizes: vec![PaperSize {
                name: "A4".into(),
                width_mm: 210,
                height_mm: 297,
            }],
            multi_page: false,
        })
    }

    fn render(&self, request: &RenderRequest, cancel: &CancelFlag) -> Result<RenderOutput, RenderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for format in &request.formats {
            let path = request.output_prefix.with_extension(format);
            if format == "png" {
                image::RgbaImage::from_pixel(320, 240, image::Rgba([30, 120, 200, 255]))
                    .save(&path)
                    .map_err(|e| RenderError::Rendering(e.to_string()))?;
            } else {
                std::fs::write(&path, b"%PDF-1.4 fake")
                    .map_err(|e| RenderError::Rendering(e.to_string()))?;
            }
        }

        let started = Instant::now();
        while started.elapsed() < self.delay {
            if cancel.is_cancelled() {
                return Err(RenderError::Interrupted);
            }
            std::thread::sleep(Duration::from_millis(10));
        }

        match self.outcome {
            Outcome::Success => Ok(RenderOutput::default()),
            Outcome::PreparationFailure => Err(RenderError::Preparation("no data".into())),
            Outcome::RenderingFailure => Err(RenderError::Rendering("renderer crashed".into())),
        }
    }
}

pub struct StaticGeocoder;

impl Geocoder for StaticGeocoder {
    fn bounding_box(&self, _osm_id: i64) -> Result<BoundingBox, GeocodeError> {
        Ok(paris_bbox())
    }
}

#[derive(Default)]
pub struct CountingNotifier(pub AtomicUsize);

impl Notifier for CountingNotifier {
    fn notify_failure(&self, _job: &Job, _error: &(dyn std::error::Error + 'static)) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn paris_bbox() -> BoundingBox {
    BoundingBox {
        lat_upper_left: 48.90,
        lon_upper_left: 2.25,
        lat_bottom_right: 48.81,
        lon_bottom_right: 2.42,
    }
}

pub fn new_job(title: &str) -> NewJob {
    NewJob {
        params: RenderParams {
            title: title.to_string(),
            area: RenderArea::BoundingBox(paris_bbox()),
            stylesheet: "default".to_string(),
            layout: "plain".to_string(),
            paper_width_mm: 210,
            paper_height_mm: 297,
            locale: "fr_FR.UTF-8".to_string(),
        },
    }
}

/// Isolated output directory plus job store.
pub struct TestHarness {
    temp_dir: TempDir,
    pub output_dir: PathBuf,
    pub store: Arc<SqliteJobStore>,
    pub notifier: Arc<CountingNotifier>,
}

impl TestHarness {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let output_dir = temp_dir.path().to_path_buf();
        let storage = OutputStorage::new(&output_dir, vec!["png".into(), "pdf".into()]);
        let db = Database::open_in_memory().expect("Failed to open database");
        Self {
            temp_dir,
            output_dir,
            store: Arc::new(SqliteJobStore::new(db, storage)),
            notifier: Arc::new(CountingNotifier::default()),
        }
    }

    pub fn storage(&self) -> OutputStorage {
        self.store.storage().clone()
    }

    pub fn submit(&self, title: &str) -> Job {
        self.store.submit(new_job(title)).expect("submit failed")
    }

    /// Submits and cancels filler jobs until the next id is `id`.
    pub fn advance_ids_to(&self, id: i64) {
        loop {
            let mut job = self.submit("filler");
            assert!(job.id < id, "id {} already taken", id);
            self.store.mark_cancelled(&mut job).expect("cancel failed");
            if job.id == id - 1 {
                return;
            }
        }
    }

    /// Submits a job and takes it to `Done` with the given message.
    pub fn finished(&self, title: &str, message: &str) -> Job {
        let mut job = self.submit(title);
        assert!(self.store.mark_started(&mut job).expect("start failed"));
        assert!(self.store.mark_finished(&mut job, message).expect("finish failed"));
        job
    }

    pub fn worker(&self, renderer: Arc<dyn Renderer>) -> Arc<Worker> {
        Arc::new(Worker::new(
            renderer,
            Arc::new(StaticGeocoder),
            self.notifier.clone(),
            ThumbnailGenerator::new(200, 200, 3),
            self.storage(),
            Span::none(),
        ))
    }

    /// Creates a sparse file of `size` bytes with the given modification time.
    pub fn put_file(&self, name: &str, size: u64, modified: SystemTime) -> PathBuf {
        let path = self.output_dir.join(name);
        let file = File::create(&path).expect("create failed");
        file.set_len(size).expect("set_len failed");
        file.set_modified(modified).expect("set_modified failed");
        path
    }

    /// Names of every file in the output directory starting with the job's
    /// files prefix, thumbnail included.
    pub fn files_of(&self, job: &Job) -> Vec<String> {
        let Some(prefix) = job.files_prefix() else {
            return Vec::new();
        };
        let mut names: Vec<String> = std::fs::read_dir(&self.output_dir)
            .expect("read_dir failed")
            .filter_map(|e| e.ok())
            .filter_map(|e| e.file_name().to_str().map(str::to_owned))
            .filter(|name| name.starts_with(&prefix))
            .collect();
        names.sort();
        names
    }

    pub fn total_size(&self) -> u64 {
        self.storage()
            .list_candidates()
            .expect("scan failed")
            .iter()
            .map(|f| f.size)
            .sum()
    }

    pub fn path(&self) -> &std::path::Path {
        self.temp_dir.path()
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Seconds-resolution point in the past, so mtimes compare deterministically.
pub fn days_ago(days: u64) -> SystemTime {
    SystemTime::UNIX_EPOCH + Duration::from_secs(1_750_000_000 - days * 86_400)
}

/// Polls `check` every 20 ms until it holds or `limit` elapses.
pub async fn wait_until(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < limit {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check()
}
