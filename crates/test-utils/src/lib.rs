pub mod builders;
pub mod fake_exporter;

use std::sync::Once;
use tracing_subscriber::{EnvFilter, fmt};

use simrunner::exporter::ExporterRegistry;
use simrunner::{Runner, RunnerOptions};

static INIT: Once = Once::new();

/// Initialise tracing for tests.
///
/// - Uses `with_test_writer()`, so logs are captured per-test.
/// - The Rust test harness only prints captured output for **failing** tests
///   (unless you run with `-- --nocapture`).
///
/// Enable levels with e.g.:
/// `RUST_LOG=debug cargo test`
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        fmt()
            .with_env_filter(filter)
            .with_test_writer() // print only for failing tests unless --nocapture
            .with_target(true)
            .init();
    });
}

/// Run a future with a 5-second timeout.
#[allow(dead_code)]
pub async fn with_timeout<F, T>(f: F) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(std::time::Duration::from_secs(5), f)
        .await
        .expect("Test timed out after 5 seconds")
}

/// A started runner with `max_workers` slots. Must be called inside a
/// Tokio runtime.
pub fn start_runner(max_workers: usize, exporters: ExporterRegistry) -> Runner {
    let workdir = std::env::temp_dir().join("simrunner-tests");
    let runner = Runner::new(
        RunnerOptions::default()
            .with_max_workers(max_workers)
            .with_workdir(workdir),
        exporters,
    )
    .expect("valid runner options");
    runner.start().expect("runner starts inside a runtime");
    runner
}
