mod common;
use crate::common::builders::jobs;
use crate::common::fake_exporter::{ControllableExporter, InstantExporter};
use crate::common::{init_tracing, start_runner, with_timeout};

use std::time::Duration;

use simrunner::errors::SimRunnerError;
use simrunner::exporter::ExporterRegistry;
use simrunner::runner::{Runner, RunnerOptions, RunnerState, default_max_workers};
use simrunner::token::TokenState;

fn new_runner(max_workers: usize, exporters: ExporterRegistry) -> Runner {
    Runner::new(
        RunnerOptions::default().with_max_workers(max_workers),
        exporters,
    )
    .unwrap()
}

#[tokio::test]
async fn submit_before_start_is_rejected() {
    let runner = new_runner(1, ExporterRegistry::new().with(InstantExporter::new("sim")));
    assert_eq!(runner.state(), RunnerState::Created);

    let err = runner.submit(jobs("job", "sim", 1)).await.unwrap_err();
    assert!(matches!(err, SimRunnerError::NotStarted));
    assert_eq!(runner.submitted_count(), 0);
}

#[test]
fn start_outside_a_runtime_fails() {
    let runner = new_runner(1, ExporterRegistry::new());

    let err = runner.start().unwrap_err();
    assert!(matches!(err, SimRunnerError::NoExecutionContext));
    assert_eq!(runner.state(), RunnerState::Created);
}

#[tokio::test]
async fn start_is_idempotent() {
    let runner = new_runner(1, ExporterRegistry::new().with(InstantExporter::new("sim")));

    runner.start().unwrap();
    runner.start().unwrap();
    assert_eq!(runner.state(), RunnerState::Started);

    let handles = runner.submit(jobs("job", "sim", 2)).await.unwrap();
    for handle in &handles {
        assert!(with_timeout(handle.wait()).await.is_success());
    }
}

#[test]
fn zero_workers_is_an_error() {
    let err = Runner::new(
        RunnerOptions::default().with_max_workers(0),
        ExporterRegistry::new(),
    )
    .unwrap_err();
    assert!(matches!(err, SimRunnerError::InvalidMaxWorkers(0)));
}

#[test]
fn default_worker_count_leaves_a_core_free() {
    let runner = Runner::new(RunnerOptions::default(), ExporterRegistry::new()).unwrap();
    assert_eq!(runner.max_workers(), default_max_workers());
    assert!(runner.max_workers() >= 1);
}

#[tokio::test]
async fn shutdown_waits_for_running_jobs_and_rejects_new_ones() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(2, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 2)).await.unwrap();
    with_timeout(exporter.wait_started(2)).await;

    with_timeout(runner.shutdown()).await.unwrap();

    for handle in &handles {
        assert!(handle.is_done());
        assert!(handle.token().state().is_terminal());
    }
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert_eq!(runner.status(), "Stopped");

    let err = runner.submit(jobs("late", "sim", 1)).await.unwrap_err();
    assert!(matches!(err, SimRunnerError::Stopped));
    assert_eq!(runner.submitted_count(), 2);
}

#[tokio::test]
async fn shutdown_cancels_queued_jobs_without_starting_them() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 3)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;

    with_timeout(runner.shutdown()).await.unwrap();

    assert!(handles.iter().all(|h| h.is_cancelled()));
    assert_eq!(exporter.started(), vec!["job-0"]);
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let runner = start_runner(1, ExporterRegistry::new());

    with_timeout(runner.shutdown()).await.unwrap();
    with_timeout(runner.shutdown()).await.unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);

    let err = runner.start().unwrap_err();
    assert!(matches!(err, SimRunnerError::Stopped));
}

#[tokio::test]
async fn shutdown_before_start_stops_immediately() {
    let runner = new_runner(1, ExporterRegistry::new());

    with_timeout(runner.shutdown()).await.unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(matches!(runner.start(), Err(SimRunnerError::Stopped)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn state_passes_through_stopping() {
    init_tracing();
    let exporter = ControllableExporter::new("sim").ignoring_cancel();
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));
    let mut states = runner.subscribe_state();

    let handles = runner.submit(jobs("job", "sim", 1)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;

    let shutdown = tokio::spawn({
        let runner = runner.clone();
        async move { runner.shutdown().await }
    });

    with_timeout(states.wait_for(|s| *s == RunnerState::Stopping))
        .await
        .unwrap();
    with_timeout(async {
        while !runner.status().starts_with("Stopping") {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(!handles[0].is_done());

    exporter.release_all();
    with_timeout(shutdown).await.unwrap().unwrap();
    assert_eq!(runner.state(), RunnerState::Stopped);
    assert!(handles[0].is_done());
}

#[tokio::test]
async fn root_token_reports_idle_and_running() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));
    assert_eq!(runner.token().state(), TokenState::NotStarted);

    let handles = runner.submit(jobs("job", "sim", 2)).await.unwrap();
    with_timeout(exporter.wait_started(1)).await;
    assert_eq!(runner.token().state(), TokenState::Running);
    assert!((runner.progress() - 0.25).abs() < 1e-9);

    exporter.release_all();
    for handle in &handles {
        with_timeout(handle.wait()).await;
    }
    // The status line is refreshed after the loop handles the last event.
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(runner.status(), "Idle");
    assert_eq!(runner.token().state(), TokenState::Done);
}
