mod common;
use crate::common::builders::jobs;
use crate::common::fake_exporter::{ControllableExporter, InstantExporter};
use crate::common::{init_tracing, names, start_runner, token_states, with_timeout};

use std::sync::mpsc;
use std::time::Duration;

use simrunner::exporter::ExporterRegistry;
use simrunner::job::Job;
use simrunner::token::{SIMULATION_CATEGORY, Token, TokenState};

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn never_more_than_max_workers_run_at_once() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(2, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 5)).await.unwrap();
    with_timeout(exporter.wait_started(2)).await;

    // Give the loop a chance to (wrongly) dispatch more.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(exporter.started().len(), 2);
    assert_eq!(exporter.running(), 2);

    let states = token_states(&handles);
    assert_eq!(&states[..2], &[TokenState::Running, TokenState::Running]);
    assert_eq!(&states[2..], &[TokenState::NotStarted; 3]);
    assert_eq!(runner.status(), "2 running, 3 queued");

    exporter.release(1);
    with_timeout(exporter.wait_started(3)).await;
    assert_eq!(exporter.started()[2], "job-2");

    exporter.release_all();
    for handle in &handles {
        assert!(with_timeout(handle.wait()).await.is_success());
    }

    assert_eq!(exporter.max_running(), 2);
    assert_eq!(runner.submitted_count(), 5);
    assert_eq!(runner.done_count(), 5);
    assert_eq!(runner.progress(), 1.0);
    assert_eq!(runner.token().state(), TokenState::Done);
}

#[tokio::test]
async fn single_worker_runs_jobs_in_submission_order() {
    init_tracing();
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner
        .submit([Job::new("job_a", "sim"), Job::new("job_b", "sim")])
        .await
        .unwrap();
    let (a, b) = (&handles[0], &handles[1]);

    let children: Vec<_> = runner
        .token()
        .get_subtokens(Some(SIMULATION_CATEGORY))
        .iter()
        .map(Token::id)
        .collect();
    assert_eq!(children, vec![a.token().id(), b.token().id()]);

    with_timeout(exporter.wait_started(1)).await;
    assert_eq!(a.token().state(), TokenState::Running);
    assert_eq!(b.token().state(), TokenState::NotStarted);
    assert_eq!(b.token().status().as_deref(), Some("Queued"));

    exporter.release(1);
    with_timeout(exporter.wait_started(2)).await;
    assert_eq!(a.token().state(), TokenState::Done);
    assert_eq!(exporter.started(), vec!["job_a", "job_b"]);

    exporter.release(1);
    assert!(with_timeout(b.wait()).await.is_success());
    assert_eq!(exporter.finished(), vec!["job_a", "job_b"]);
}

#[tokio::test]
async fn later_batches_queue_behind_earlier_ones() {
    init_tracing();
    let exporter = InstantExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let first = runner.submit(jobs("first", "sim", 3)).await.unwrap();
    let second = runner.submit(jobs("second", "sim", 2)).await.unwrap();

    for handle in first.iter().chain(second.iter()) {
        assert!(with_timeout(handle.wait()).await.is_success());
    }

    let mut expected = names(&first);
    expected.extend(names(&second));
    assert_eq!(exporter.ran(), expected);

    let ids: Vec<u64> = first.iter().chain(&second).map(|h| h.id().get()).collect();
    assert!(ids.windows(2).all(|w| w[0] < w[1]));
}

#[tokio::test]
async fn empty_submit_returns_no_handles() {
    let runner = start_runner(2, ExporterRegistry::new().with(InstantExporter::new("sim")));

    let handles = runner.submit(Vec::new()).await.unwrap();
    assert!(handles.is_empty());
    assert_eq!(runner.submitted_count(), 0);
}

#[tokio::test]
async fn done_callbacks_fire_once_with_the_outcome() {
    let exporter = ControllableExporter::new("sim");
    let runner = start_runner(1, ExporterRegistry::new().with(exporter.clone()));

    let handles = runner.submit(jobs("job", "sim", 1)).await.unwrap();
    let handle = &handles[0];

    let (tx, rx) = mpsc::channel();
    handle.add_done_callback(move |outcome| tx.send(outcome.is_success()).unwrap());
    assert!(!handle.is_done());

    exporter.release(1);
    with_timeout(handle.wait()).await;
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(true));
    assert!(rx.try_recv().is_err());

    // Registered after completion: runs right away.
    let (tx, rx) = mpsc::channel();
    handle.add_done_callback(move |outcome| tx.send(outcome.is_success()).unwrap());
    assert_eq!(rx.try_recv(), Ok(true));
}

#[tokio::test]
async fn job_handle_exposes_its_job() {
    let runner = start_runner(1, ExporterRegistry::new().with(InstantExporter::new("sim")));

    let handles = runner.submit([Job::new("cu_15kv", "sim")]).await.unwrap();
    let handle = &handles[0];

    assert_eq!(handle.name(), "cu_15kv");
    assert_eq!(handle.program(), "sim");
    assert_eq!(
        handle.token().category().as_deref(),
        Some(SIMULATION_CATEGORY)
    );

    let outcome = with_timeout(handle.wait()).await;
    assert!(outcome.is_success());
    assert_eq!(handle.token().progress(), 1.0);
    assert_eq!(handle.token().status().as_deref(), Some("Done"));
}
