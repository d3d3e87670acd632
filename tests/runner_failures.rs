mod common;
use crate::common::builders::jobs;
use crate::common::fake_exporter::{FailingExporter, InstantExporter, PanickingExporter};
use crate::common::{init_tracing, start_runner, with_timeout};

use simrunner::errors::ExportError;
use simrunner::exporter::ExporterRegistry;
use simrunner::job::Job;
use simrunner::token::TokenState;

fn registry(sim: &InstantExporter) -> ExporterRegistry {
    ExporterRegistry::new()
        .with(sim.clone())
        .with(FailingExporter::new("broken", "boom"))
        .with(PanickingExporter::new("explode"))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn one_failing_job_does_not_affect_its_batch() {
    init_tracing();
    let sim = InstantExporter::new("sim");
    let runner = start_runner(2, registry(&sim));

    let handles = runner
        .submit([
            Job::new("a", "broken"),
            Job::new("b", "sim"),
            Job::new("c", "sim"),
        ])
        .await
        .unwrap();

    let outcomes: Vec<_> = {
        let mut out = Vec::new();
        for handle in &handles {
            out.push(with_timeout(handle.wait()).await);
        }
        out
    };

    assert!(outcomes[0].is_failed());
    let err = outcomes[0].error().unwrap();
    assert!(err.to_string().contains("boom"));
    assert!(outcomes[1].is_success());
    assert!(outcomes[2].is_success());
    let mut ran = sim.ran();
    ran.sort();
    assert_eq!(ran, vec!["b", "c"]);

    // A failed job still ends in Done; progress stays where it stopped.
    let failed = handles[0].token();
    assert_eq!(failed.state(), TokenState::Done);
    assert!((failed.progress() - 0.3).abs() < 1e-9);
    assert!(failed.status().unwrap().starts_with("Failed"));

    assert_eq!(runner.done_count(), 3);
    assert_eq!(runner.token().state(), TokenState::Done);
}

#[tokio::test]
async fn panicking_exporter_is_contained() {
    init_tracing();
    let sim = InstantExporter::new("sim");
    let runner = start_runner(1, registry(&sim));

    let handles = runner
        .submit([Job::new("bad", "explode"), Job::new("good", "sim")])
        .await
        .unwrap();

    let bad = with_timeout(handles[0].wait()).await;
    match bad.error() {
        Some(ExportError::Panicked(message)) => assert!(message.contains("exploded on bad")),
        other => panic!("expected a panic failure, got {other:?}"),
    }
    assert_eq!(handles[0].token().state(), TokenState::Done);

    assert!(with_timeout(handles[1].wait()).await.is_success());

    // The slot freed by the panicking job is reused.
    let more = runner.submit(jobs("later", "sim", 2)).await.unwrap();
    for handle in &more {
        assert!(with_timeout(handle.wait()).await.is_success());
    }
}

#[tokio::test]
async fn unknown_program_fails_only_that_job() {
    let sim = InstantExporter::new("sim");
    let runner = start_runner(2, registry(&sim));

    let handles = runner
        .submit([Job::new("lost", "no-such-program"), Job::new("fine", "sim")])
        .await
        .unwrap();

    let lost = with_timeout(handles[0].wait()).await;
    assert!(matches!(
        lost.error(),
        Some(ExportError::UnknownProgram(p)) if p == "no-such-program"
    ));
    assert!(with_timeout(handles[1].wait()).await.is_success());
}

#[tokio::test]
async fn invalid_job_at_run_time_is_a_failure() {
    let sim = InstantExporter::new("strict").with_required("energy");
    let runner = start_runner(1, ExporterRegistry::new().with(sim.clone()));

    let handles = runner.submit([Job::new("bare", "strict")]).await.unwrap();
    let outcome = with_timeout(handles[0].wait()).await;

    assert!(matches!(
        outcome.error(),
        Some(ExportError::InvalidJob { job, .. }) if job == "bare"
    ));
    assert!(sim.ran().is_empty());
}
