mod common;
use crate::common::builders::jobs;
use crate::common::fake_exporter::ControllableExporter;
use crate::common::{init_tracing, start_runner, token_states, with_timeout};

use std::collections::BTreeSet;
use std::time::Duration;

use simrunner::exporter::ExporterRegistry;
use simrunner::runner::{JobOutcome, Runner, RunnerOptions};
use simrunner::token::TokenState;

#[tokio::test]
async fn cancel_after_first_job_completes() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 3)).await.unwrap();

    with_timeout(exporter.wait_started(1)).await;
    exporter.release(1);
    assert!(with_timeout(handles[0].wait()).await.is_success());
    with_timeout(exporter.wait_started(2)).await;

    with_timeout(runner.cancel()).await.unwrap();

    assert!(handles[0].is_done());
    assert!(!handles[0].is_cancelled());
    assert!(handles[1].is_cancelled());
    assert!(handles[2].is_cancelled());

    // The queued job never reached its exporter.
    assert_eq!(exporter.started(), vec!["job-0", "job-1"]);
    assert_eq!(exporter.cancelled(), BTreeSet::from(["job-1".to_string()]));

    assert_eq!(
        token_states(&handles),
        vec![TokenState::Done, TokenState::Cancelled, TokenState::Cancelled]
    );
    assert_eq!(runner.done_count(), 3);
    assert_eq!(runner.token().state(), TokenState::Cancelled);
}

#[tokio::test]
async fn cancel_twice_matches_cancel_once() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(2, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 4)).await.unwrap();
    with_timeout(exporter.wait_started(2)).await;

    with_timeout(runner.cancel()).await.unwrap();
    let once = token_states(&handles);
    let done_once = runner.done_count();

    with_timeout(runner.cancel()).await.unwrap();
    assert_eq!(token_states(&handles), once);
    assert_eq!(runner.done_count(), done_once);
    assert!(handles.iter().all(|h| h.is_cancelled()));
}

#[tokio::test]
async fn cancel_with_nothing_running_resolves() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(2, ExporterRegistry::new().with(exporter.clone()));

    with_timeout(runner.cancel()).await.unwrap();
    with_timeout(runner.cancel()).await.unwrap();

    // Not started at all: still a no-op.
    let idle = Runner::new(
        RunnerOptions::default().with_max_workers(1),
        ExporterRegistry::new(),
    )
    .unwrap();
    with_timeout(idle.cancel()).await.unwrap();
}

#[tokio::test]
async fn runner_keeps_accepting_jobs_after_cancel() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let first = runner.submit(jobs("old", "sim", 2)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;
    with_timeout(runner.cancel()).await.unwrap();
    assert!(first.iter().all(|h| h.is_cancelled()));

    let second = runner.submit(jobs("new", "sim", 1)).await.unwrap();
    with_timeout(exporter.wait_started(2)).await;
    exporter.release(1);
    assert!(with_timeout(second[0].wait()).await.is_success());
}

#[tokio::test]
async fn cancel_job_stops_a_running_job_only() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(2, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 3)).await.unwrap();
    with_timeout(exporter.wait_started(2)).await;

    with_timeout(runner.cancel_job(&handles[0])).await.unwrap();
    assert!(handles[0].is_cancelled());
    assert_eq!(handles[0].token().state(), TokenState::Cancelled);

    // Its slot goes to the queued job.
    with_timeout(exporter.wait_started(3)).await;
    exporter.release_all();
    assert!(with_timeout(handles[1].wait()).await.is_success());
    assert!(with_timeout(handles[2].wait()).await.is_success());

    // Cancelling a finished job changes nothing.
    with_timeout(runner.cancel_job(&handles[1])).await.unwrap();
    assert!(handles[1].outcome().unwrap().is_success());
}

#[tokio::test]
async fn cancel_job_on_a_queued_job_skips_its_exporter() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 2)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;

    with_timeout(runner.cancel_job(&handles[1])).await.unwrap();
    assert!(handles[1].is_cancelled());
    assert_eq!(handles[1].token().state(), TokenState::Cancelled);

    exporter.release(1);
    assert!(with_timeout(handles[0].wait()).await.is_success());
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(exporter.started(), vec!["job-0"]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancel_waits_for_an_exporter_that_ignores_it() {
    init_tracing();
    let exporter = ControllableExporter::new("stubborn").ignoring_cancel();
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "stubborn", 1)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;

    let cancel = tokio::spawn({
        let runner = runner.clone();
        async move { runner.cancel().await }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!cancel.is_finished());
    assert_eq!(handles[0].token().status().as_deref(), Some("Cancelling"));

    exporter.release_all();
    with_timeout(cancel).await.unwrap().unwrap();

    // The exporter finished its work regardless.
    assert!(handles[0].outcome().unwrap().is_success());
}

#[tokio::test]
async fn job_timeout_cancels_long_running_jobs() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = Runner::new(
        RunnerOptions::default()
            .with_max_workers(2)
            .with_job_timeout(Duration::from_millis(100)),
        ExporterRegistry::new().with(exporter.clone()),
    )
    .unwrap();
    runner.start().unwrap();

    let handles = runner.submit(jobs("slow", "sim", 1)).await.unwrap();
    let outcome = with_timeout(handles[0].wait()).await;

    assert!(matches!(outcome, JobOutcome::Cancelled));
    assert_eq!(exporter.cancelled(), BTreeSet::from(["slow-0".to_string()]));
}
