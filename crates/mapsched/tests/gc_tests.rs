//! Storage collection against synthetic output directories.

mod common;

use std::sync::Arc;

use tracing::Span;

use common::{days_ago, TestHarness, GIB, KIB};
use mapsched::config::load_config_from_str;
use mapsched::jobs::{JobStatus, JobStore};
use mapsched::GarbageCollector;

fn collector(harness: &TestHarness, capacity: u64) -> GarbageCollector {
    GarbageCollector::new(
        harness.store.clone(),
        capacity,
        0.8,
        mapsched::gc::DEFAULT_INTERVAL,
        Span::none(),
    )
}

#[test]
fn test_one_cycle_evicts_oldest_job_below_threshold() {
    let harness = TestHarness::new();
    let config = load_config_from_str(&format!(
        r#"{{"version": "1.0", "output_directory": "{}", "storage_capacity_gb": 1.0}}"#,
        harness.output_dir.display()
    ))
    .unwrap();
    let gc = GarbageCollector::from_config(harness.store.clone(), &config, Span::none());
    assert_eq!(gc.threshold(), 858_993_459);

    let old = harness.finished("Old Town", "ok");
    let new = harness.finished("New Town", "ok");
    let old_prefix = old.files_prefix().unwrap();
    let new_prefix = new.files_prefix().unwrap();

    let old_png = GIB * 2 / 10;
    let old_pdf = GIB / 10;
    harness.put_file(&format!("{}.png", old_prefix), old_png, days_ago(30));
    harness.put_file(&format!("{}.pdf", old_prefix), old_pdf, days_ago(30));
    harness.put_file(&format!("{}_small.png", old_prefix), 20 * KIB, days_ago(30));
    harness.put_file(&format!("{}.png", new_prefix), GIB - old_png - old_pdf, days_ago(1));
    assert_eq!(harness.total_size(), GIB);

    let report = gc.collect().unwrap();

    assert_eq!(report.size_before, GIB);
    assert!(report.size_after <= gc.threshold());
    assert_eq!(harness.total_size(), report.size_after);
    assert_eq!(report.jobs_evicted, 1);
    assert_eq!(report.bytes_saved, old_png + old_pdf);

    assert_eq!(harness.store.get(old.id).unwrap().unwrap().status, JobStatus::DoneNoFiles);
    assert_eq!(harness.store.get(new.id).unwrap().unwrap().status, JobStatus::Done);
    // The preview of the evicted job survives.
    assert_eq!(harness.files_of(&old), vec![format!("{}_small.png", old_prefix)]);
}

#[test]
fn test_orphan_removed_without_touching_jobs() {
    let harness = TestHarness::new();
    let job = harness.finished("Kept", "ok");
    let prefix = job.files_prefix().unwrap();
    harness.put_file("999999_2020-01-01_00-00_Ghost.png", 60 * KIB, days_ago(2000));
    harness.put_file(&format!("{}.png", prefix), 30 * KIB, days_ago(1));
    let before = harness.store.all_jobs().unwrap();

    let report = collector(&harness, 100 * KIB).collect().unwrap();

    assert_eq!(report.orphans_removed, 1);
    assert_eq!(report.jobs_evicted, 0);
    assert!(!harness.output_dir.join("999999_2020-01-01_00-00_Ghost.png").exists());
    assert_eq!(harness.store.all_jobs().unwrap(), before);
}

#[test]
fn test_repeated_cycles_converge() {
    let harness = TestHarness::new();
    let mut expected_total = 0;
    for i in 0..10u64 {
        let job = harness.finished(&format!("City {}", i), "ok");
        let prefix = job.files_prefix().unwrap();
        let size = (i % 4 + 1) * 10 * KIB;
        harness.put_file(&format!("{}.png", prefix), size, days_ago(100 - i));
        harness.put_file(&format!("{}.pdf", prefix), size / 2, days_ago(100 - i));
        harness.put_file(&format!("{}_small.png", prefix), KIB, days_ago(100 - i));
        expected_total += size + size / 2;
    }
    for i in 0..5u64 {
        harness.put_file(&format!("stray-{}.svg", i), 7 * KIB, days_ago(95 - i * 2));
        expected_total += 7 * KIB;
    }
    assert_eq!(harness.total_size(), expected_total);

    let gc = collector(&harness, 200 * KIB);
    let mut cycles = 0;
    loop {
        cycles += 1;
        let report = gc.collect().unwrap();
        assert!(!report.exhausted);
        if !report.evicted_anything() {
            break;
        }
        assert!(report.size_after <= gc.threshold());
        assert!(cycles < 5, "collector did not settle");
    }

    assert!(harness.total_size() <= gc.threshold());
    // Oldest first: the oldest job went, the newest stayed.
    let jobs = harness.store.all_jobs().unwrap();
    assert_eq!(jobs[0].status, JobStatus::DoneNoFiles);
    assert_eq!(jobs[9].status, JobStatus::Done);
}

#[test]
fn test_nothing_evictable_is_reported() {
    let harness = TestHarness::new();
    let job = harness.finished("Pinned", "ok");
    harness.put_file(
        &format!("{}.png", job.files_prefix().unwrap()),
        90 * KIB,
        days_ago(3),
    );
    // Owner lookups fail from here on, so nothing can be evicted.
    harness
        .store
        .database()
        .with_conn(|conn| Ok(conn.execute_batch("DROP TABLE jobs")?))
        .unwrap();

    let report = collector(&harness, 100 * KIB).collect().unwrap();

    assert!(report.exhausted);
    assert!(!report.evicted_anything());
    assert_eq!(report.size_after, 90 * KIB);
}

#[tokio::test]
async fn test_background_loop_stops_on_shutdown() {
    let harness = TestHarness::new();
    harness.put_file("000042_2020-01-01_00-00_Gone.png", 90 * KIB, days_ago(10));
    let gc = Arc::new(collector(&harness, 100 * KIB));
    let shutdown = tokio_util::sync::CancellationToken::new();
    let handle = tokio::spawn(gc.run(shutdown.clone()));

    let path = harness.output_dir.join("000042_2020-01-01_00-00_Gone.png");
    let removed = common::wait_until(std::time::Duration::from_secs(5), || !path.exists()).await;
    shutdown.cancel();
    handle.await.unwrap();

    assert!(removed);
}
