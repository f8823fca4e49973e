//! Storage garbage collector.
//!
//! Keeps the output directory under a fraction of its configured capacity
//! by evicting the oldest jobs' output files. Thumbnails are never
//! evicted, so previews of old jobs stay browsable.
//!
//! The collector does not coordinate with running workers. A job that
//! finishes while a cycle is scanning may have freshly written files
//! evicted; this is accepted at the expected scale.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn, Instrument, Span};

use crate::config::Config;
use crate::error::StoreError;
use crate::jobs::JobStore;
use crate::storage::{remove_if_exists, StoredFile};

/// Default pause between two cycles.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(20);

/// Share of the capacity usage is brought back under.
pub const DEFAULT_THRESHOLD_RATIO: f64 = 0.8;

const MIB: f64 = 1024.0 * 1024.0;

fn mib(bytes: u64) -> String {
    format!("{:.1} MiB", bytes as f64 / MIB)
}

/// Outcome of one collection cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectionReport {
    pub scanned_files: usize,
    pub size_before: u64,
    pub size_after: u64,
    pub threshold: u64,
    pub jobs_evicted: usize,
    pub orphans_removed: usize,
    pub files_removed: usize,
    pub bytes_saved: u64,
    /// Candidates ran out while still above the threshold.
    pub exhausted: bool,
}

impl CollectionReport {
    pub fn evicted_anything(&self) -> bool {
        self.files_removed > 0
    }
}

pub struct GarbageCollector {
    store: Arc<dyn JobStore>,
    capacity_bytes: u64,
    threshold_ratio: f64,
    interval: Duration,
    span: Span,
}

impl GarbageCollector {
    pub fn new(
        store: Arc<dyn JobStore>,
        capacity_bytes: u64,
        threshold_ratio: f64,
        interval: Duration,
        span: Span,
    ) -> Self {
        Self {
            store,
            capacity_bytes,
            threshold_ratio,
            interval,
            span,
        }
    }

    pub fn from_config(store: Arc<dyn JobStore>, config: &Config, span: Span) -> Self {
        Self::new(
            store,
            config.capacity_bytes(),
            config.gc.threshold_ratio,
            config.gc.interval(),
            span,
        )
    }

    /// Usage ceiling in bytes.
    pub fn threshold(&self) -> u64 {
        (self.capacity_bytes as f64 * self.threshold_ratio) as u64
    }

    /// Runs one cycle. Per-file failures are logged and skipped; only a
    /// failure to scan the directory is returned.
    pub fn collect(&self) -> Result<CollectionReport, StoreError> {
        let _entered = self.span.enter();
        let started = Instant::now();
        let threshold = self.threshold();

        let mut files = self.store.storage().list_candidates()?;
        let size_before: u64 = files.iter().map(|f| f.size).sum();
        let mut report = CollectionReport {
            scanned_files: files.len(),
            size_before,
            size_after: size_before,
            threshold,
            ..Default::default()
        };

        if size_before <= threshold {
            debug!(
                size = %mib(size_before),
                threshold = %mib(threshold),
                "Storage under threshold"
            );
            return Ok(report);
        }

        info!(
            files = files.len(),
            size = %mib(size_before),
            threshold = %mib(threshold),
            "Storage over threshold, evicting oldest jobs"
        );

        // Newest first so `pop` yields the oldest, ties broken by name.
        files.sort_by(|a, b| (b.modified, &b.name).cmp(&(a.modified, &a.name)));

        let mut total = size_before;
        while total > threshold {
            let Some(file) = files.pop() else {
                report.exhausted = true;
                error!(
                    size = %mib(total),
                    threshold = %mib(threshold),
                    "Nothing left to evict but storage is still over threshold, check the configured capacity"
                );
                break;
            };
            total = total.saturating_sub(self.evict(&file, &mut files, &mut report));
        }

        report.size_after = total;
        info!(
            jobs = report.jobs_evicted,
            orphans = report.orphans_removed,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "saved {}, now {}/{}",
            mib(report.bytes_saved),
            mib(total),
            mib(self.capacity_bytes)
        );
        Ok(report)
    }

    /// Evicts whatever `file` belongs to and returns the bytes it freed.
    fn evict(
        &self,
        file: &StoredFile,
        remaining: &mut Vec<StoredFile>,
        report: &mut CollectionReport,
    ) -> u64 {
        let owner = match self.store.find_by_output_filename(&file.name) {
            Ok(owner) => owner,
            Err(e) => {
                warn!(file = %file.name, error = %e, "Could not resolve file owner, skipped");
                return 0;
            }
        };

        let mut freed = 0;
        let orphan = owner.is_none();
        if let Some(mut job) = owner {
            match self.store.delete_output_files(&mut job) {
                Ok((0, _)) => {}
                Ok((removed, saved)) => {
                    info!(job_id = job.id, files = removed, size = %mib(saved), "Evicted job output");
                    report.jobs_evicted += 1;
                    report.files_removed += removed;
                    report.bytes_saved += saved;
                    freed = saved;
                }
                Err(e) => {
                    warn!(job_id = job.id, error = %e, "Could not evict job output");
                    return 0;
                }
            }
            // Files of this job that are now gone need no visit of their own.
            if let Some(prefix) = job.files_prefix() {
                remaining.retain(|f| !f.name.starts_with(&prefix) || f.path.exists());
            }
            if !file.path.exists() {
                return freed;
            }
            debug!(file = %file.name, "Removing stray file of evicted job");
        } else {
            debug!(file = %file.name, "Removing orphaned file");
        }

        match remove_if_exists(&file.path) {
            Ok(removed) => {
                if removed {
                    report.files_removed += 1;
                    report.bytes_saved += file.size;
                    if orphan {
                        report.orphans_removed += 1;
                    }
                }
                // Gone either way, so it no longer counts toward usage.
                freed + file.size
            }
            Err(e) => {
                warn!(file = %file.name, error = %e, "Could not remove file");
                freed
            }
        }
    }

    /// Runs a cycle right away, then every interval until `shutdown` is
    /// cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let span = self.span.clone();
        async move {
            info!(
                capacity = %mib(self.capacity_bytes),
                threshold = %mib(self.threshold()),
                interval_secs = self.interval.as_secs(),
                "Garbage collector starting"
            );
            loop {
                let gc = self.clone();
                match tokio::task::spawn_blocking(move || gc.collect()).await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => error!(error = %e, "Garbage collection cycle failed"),
                    Err(e) => error!(error = %e, "Garbage collection task failed"),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => {
                        info!("Garbage collector shutting down");
                        break;
                    }
                    _ = tokio::time::sleep(self.interval) => {}
                }
            }
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::time::SystemTime;

    use crate::db::Database;
    use crate::jobs::{
        BoundingBox, Job, JobStatus, NewJob, RenderArea, RenderParams, SqliteJobStore,
    };
    use crate::storage::OutputStorage;
    use tempfile::TempDir;

    const KIB: u64 = 1024;

    fn store(dir: &TempDir) -> Arc<SqliteJobStore> {
        Arc::new(SqliteJobStore::new(
            Database::open_in_memory().unwrap(),
            OutputStorage::new(dir.path(), vec!["png".into(), "pdf".into()]),
        ))
    }

    fn done_job(store: &SqliteJobStore, title: &str) -> Job {
        let mut job = store
            .submit(NewJob {
                params: RenderParams {
                    title: title.into(),
                    area: RenderArea::BoundingBox(BoundingBox {
                        lat_upper_left: 1.0,
                        lon_upper_left: 0.0,
                        lat_bottom_right: 0.0,
                        lon_bottom_right: 1.0,
                    }),
                    stylesheet: "default".into(),
                    layout: "plain".into(),
                    paper_width_mm: 210,
                    paper_height_mm: 297,
                    locale: "en_US.UTF-8".into(),
                },
            })
            .unwrap();
        store.mark_started(&mut job).unwrap();
        store.mark_finished(&mut job, "ok").unwrap();
        job
    }

    /// Creates a sparse file of `size` bytes, `age_secs` old.
    fn put(dir: &TempDir, name: &str, size: u64, age_secs: u64) {
        let file = File::create(dir.path().join(name)).unwrap();
        file.set_len(size).unwrap();
        let base = SystemTime::UNIX_EPOCH + Duration::from_secs(1_700_000_000);
        file.set_modified(base - Duration::from_secs(age_secs)).unwrap();
    }

    fn collector(store: Arc<SqliteJobStore>, capacity: u64) -> GarbageCollector {
        GarbageCollector::new(store, capacity, 0.8, DEFAULT_INTERVAL, Span::none())
    }

    #[test]
    fn test_under_threshold_does_nothing() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        put(&dir, "ghost.png", 10 * KIB, 100);

        let report = collector(store, 100 * KIB).collect().unwrap();
        assert_eq!(report.scanned_files, 1);
        assert!(!report.evicted_anything());
        assert!(dir.path().join("ghost.png").exists());
    }

    #[test]
    fn test_evicts_oldest_job_and_keeps_thumbnail() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let old = done_job(&store, "Old");
        let new = done_job(&store, "New");
        let old_prefix = old.files_prefix().unwrap();
        let new_prefix = new.files_prefix().unwrap();

        put(&dir, &format!("{}.png", old_prefix), 30 * KIB, 300);
        put(&dir, &format!("{}.pdf", old_prefix), 10 * KIB, 200);
        put(&dir, &format!("{}_small.png", old_prefix), 5 * KIB, 300);
        put(&dir, &format!("{}.png", new_prefix), 50 * KIB, 10);

        let report = collector(store.clone(), 100 * KIB).collect().unwrap();

        assert_eq!(report.size_before, 90 * KIB);
        assert_eq!(report.jobs_evicted, 1);
        assert_eq!(report.files_removed, 2);
        assert_eq!(report.bytes_saved, 40 * KIB);
        assert!(report.size_after <= report.threshold);
        assert!(!report.exhausted);

        assert_eq!(store.get(old.id).unwrap().unwrap().status, JobStatus::DoneNoFiles);
        assert_eq!(store.get(new.id).unwrap().unwrap().status, JobStatus::Done);
        assert!(dir.path().join(format!("{}_small.png", old_prefix)).exists());
        assert!(dir.path().join(format!("{}.png", new_prefix)).exists());
    }

    #[test]
    fn test_orphan_removed_directly() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        let job = done_job(&store, "Kept");
        put(&dir, "999999_2020-01-01_00-00_Ghost.png", 60 * KIB, 1000);
        put(&dir, &format!("{}.png", job.files_prefix().unwrap()), 30 * KIB, 10);

        let report = collector(store.clone(), 100 * KIB).collect().unwrap();

        assert_eq!(report.orphans_removed, 1);
        assert_eq!(report.jobs_evicted, 0);
        assert!(!dir.path().join("999999_2020-01-01_00-00_Ghost.png").exists());
        assert!(store.get(job.id).unwrap().unwrap().is_done_ok());
    }

    #[test]
    fn test_same_mtime_ties_break_by_name() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        put(&dir, "b_orphan.png", 50 * KIB, 100);
        put(&dir, "a_orphan.png", 50 * KIB, 100);

        let report = collector(store, 100 * KIB).collect().unwrap();

        assert_eq!(report.files_removed, 1);
        assert!(!dir.path().join("a_orphan.png").exists());
        assert!(dir.path().join("b_orphan.png").exists());
    }

    #[test]
    fn test_reports_exhaustion_when_nothing_evictable() {
        let dir = TempDir::new().unwrap();
        let store = store(&dir);
        put(&dir, "000001_2024-01-01_00-00_Stuck.png", 90 * KIB, 100);
        // Owner lookups now fail, so the file is skipped.
        store
            .database()
            .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE jobs")?))
            .unwrap();

        let report = collector(store, 100 * KIB).collect().unwrap();

        assert!(report.exhausted);
        assert_eq!(report.size_after, 90 * KIB);
        assert!(dir.path().join("000001_2024-01-01_00-00_Stuck.png").exists());
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let dir = TempDir::new().unwrap();
        put(&dir, "ghost.png", 90 * KIB, 100);
        let gc = Arc::new(collector(store(&dir), 100 * KIB));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(gc.run(shutdown.clone()));

        // First cycle runs immediately.
        for _ in 0..100 {
            if !dir.path().join("ghost.png").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!dir.path().join("ghost.png").exists());

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
