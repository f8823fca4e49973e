//! Hard timeouts with process isolation.

mod common;

use std::time::{Duration, Instant};

use tracing::Span;

use common::TestHarness;
use mapsched::executor::{ExecutionPolicy, ExecutorState};
use mapsched::jobs::JobStore;
use mapsched::{ProcessLauncher, ResultCode, SupervisedExecutor};

fn sh(script: &str) -> ProcessLauncher {
    ProcessLauncher::new("/bin/sh", vec!["-c".to_string(), script.to_string()])
}

#[tokio::test]
async fn test_hung_worker_times_out_within_bound() {
    let harness = TestHarness::new();
    harness.advance_ids_to(8);
    let mut job = harness.submit("Stuck");
    assert_eq!(job.id, 8);
    harness.store.mark_started(&mut job).unwrap();

    // Partial output, as a renderer killed mid-write would leave it.
    let prefix = job.files_prefix().unwrap();
    std::fs::write(harness.output_dir.join(format!("{}.png", prefix)), b"partial").unwrap();

    let executor = SupervisedExecutor::new(
        sh("sleep 3600"),
        harness.storage(),
        Duration::from_secs(5),
        Span::none(),
    );

    let started = Instant::now();
    let result = executor.run(&job).await;
    let elapsed = started.elapsed();

    assert_eq!(result, ResultCode::TimedOut);
    assert!(elapsed >= Duration::from_secs(5));
    assert!(elapsed < Duration::from_secs(7), "took {:?}", elapsed);
    assert!(harness.files_of(&job).is_empty());
}

#[tokio::test]
async fn test_timeout_kills_whole_process_tree() {
    let harness = TestHarness::new();
    let mut job = harness.submit("Tree");
    harness.store.mark_started(&mut job).unwrap();
    let prefix = job.files_prefix().unwrap();
    let marker = harness.output_dir.join(format!("{}.pdf", prefix));

    // The grandchild would write a file after the timeout if it survived.
    let script = format!("(sleep 2; touch '{}') & sleep 3600", marker.display());
    let executor = SupervisedExecutor::new(
        sh(&script),
        harness.storage(),
        Duration::from_millis(500),
        Span::none(),
    );

    assert_eq!(executor.execute(&job).await, ExecutorState::TimedOut);
    tokio::time::sleep(Duration::from_secs(3)).await;
    assert!(!marker.exists());
    assert!(harness.files_of(&job).is_empty());
}

#[tokio::test]
async fn test_worker_exit_code_is_the_result() {
    let harness = TestHarness::new();
    let mut job = harness.submit("Exit");
    harness.store.mark_started(&mut job).unwrap();
    let prefix = job.files_prefix().unwrap();
    let png = harness.output_dir.join(format!("{}.png", prefix));

    let ok = SupervisedExecutor::new(
        sh(&format!("echo png > '{}'; exit 0", png.display())),
        harness.storage(),
        Duration::from_secs(10),
        Span::none(),
    );
    assert_eq!(ok.run(&job).await, ResultCode::Success);
    assert!(png.exists());

    let failing = SupervisedExecutor::new(
        sh("exit 2"),
        harness.storage(),
        Duration::from_secs(10),
        Span::none(),
    );
    assert_eq!(failing.run(&job).await, ResultCode::PreparationFailed);
    assert!(!png.exists());
}

#[tokio::test]
async fn test_unlaunchable_worker_is_rendering_failure() {
    let harness = TestHarness::new();
    let mut job = harness.submit("Missing");
    harness.store.mark_started(&mut job).unwrap();

    let executor = SupervisedExecutor::new(
        ProcessLauncher::new("/nonexistent/mapsched", Vec::new()),
        harness.storage(),
        Duration::from_secs(1),
        Span::none(),
    );
    assert_eq!(executor.run(&job).await, ResultCode::RenderingFailed);
}
