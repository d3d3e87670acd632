use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::anyhow;
use tokio::sync::{Semaphore, watch};

use simrunner::accumulator::Issue;
use simrunner::errors::ExportError;
use simrunner::exporter::{ExportFuture, ExportRequest, Exporter};
use simrunner::job::JobOutput;

/// Succeeds immediately.
///
/// - records which jobs were run (dry runs are recorded separately)
/// - reports a missing `required` option as an exception, and an option
///   that is not required as a warning
#[derive(Clone)]
pub struct InstantExporter {
    program: String,
    required: Vec<String>,
    ran: Arc<Mutex<Vec<String>>>,
    dry_ran: Arc<Mutex<Vec<String>>>,
}

impl InstantExporter {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            required: Vec::new(),
            ran: Arc::new(Mutex::new(Vec::new())),
            dry_ran: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn with_required(mut self, key: &str) -> Self {
        self.required.push(key.to_string());
        self
    }

    /// Jobs that ran for real, in start order.
    pub fn ran(&self) -> Vec<String> {
        self.ran.lock().unwrap().clone()
    }

    pub fn dry_ran(&self) -> Vec<String> {
        self.dry_ran.lock().unwrap().clone()
    }
}

impl Exporter for InstantExporter {
    fn program(&self) -> &str {
        &self.program
    }

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a> {
        Box::pin(async move {
            let ExportRequest {
                job,
                errors,
                dry_run,
                token,
                ..
            } = request;

            for key in &self.required {
                if !job.options.contains_key(key) {
                    errors.add_exception(Issue::new(
                        &job.name,
                        format!("missing required option '{key}'"),
                    ));
                }
            }
            for key in job.options.keys() {
                if !self.required.contains(key) {
                    errors.add_warning(Issue::new(&job.name, format!("option '{key}' is ignored")));
                }
            }

            if dry_run {
                self.dry_ran.lock().unwrap().push(job.name.clone());
                return Ok(JobOutput::default());
            }
            if errors.has_exceptions_for(&job.name) {
                return Err(ExportError::InvalidJob {
                    job: job.name.clone(),
                    reason: errors.exception_messages().join("; "),
                });
            }

            self.ran.lock().unwrap().push(job.name.clone());
            token.set_progress(1.0);
            Ok(JobOutput {
                output_dir: None,
                warnings: errors.warnings(),
            })
        })
    }
}

/// Reports some progress, then fails with `message`.
#[derive(Clone)]
pub struct FailingExporter {
    program: String,
    message: String,
}

impl FailingExporter {
    pub fn new(program: &str, message: &str) -> Self {
        Self {
            program: program.to_string(),
            message: message.to_string(),
        }
    }
}

impl Exporter for FailingExporter {
    fn program(&self) -> &str {
        &self.program
    }

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a> {
        Box::pin(async move {
            if request.dry_run {
                return Ok(JobOutput::default());
            }
            request.token.set_progress(0.3);
            Err(ExportError::Other(anyhow!("{}", self.message)))
        })
    }
}

/// Panics when run for real.
#[derive(Clone)]
pub struct PanickingExporter {
    program: String,
}

impl PanickingExporter {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
        }
    }
}

impl Exporter for PanickingExporter {
    fn program(&self) -> &str {
        &self.program
    }

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a> {
        Box::pin(async move {
            if request.dry_run {
                return Ok(JobOutput::default());
            }
            panic!("exporter exploded on {}", request.job.name);
        })
    }
}

struct ControlState {
    gate: Semaphore,
    started: Mutex<Vec<String>>,
    started_count: watch::Sender<usize>,
    cancelled: Mutex<BTreeSet<String>>,
    finished: Mutex<Vec<String>>,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

/// Blocks every job until the test releases it.
///
/// - `release(n)` lets `n` blocked jobs finish successfully
/// - `release_all()` lets every current and future job through
/// - cancellation is honoured unless built with `ignoring_cancel()`
/// - records start order, cancelled jobs and peak concurrency
#[derive(Clone)]
pub struct ControllableExporter {
    program: String,
    honour_cancel: bool,
    state: Arc<ControlState>,
}

impl ControllableExporter {
    pub fn new(program: &str) -> Self {
        let (started_count, _) = watch::channel(0);
        Self {
            program: program.to_string(),
            honour_cancel: true,
            state: Arc::new(ControlState {
                gate: Semaphore::new(0),
                started: Mutex::new(Vec::new()),
                started_count,
                cancelled: Mutex::new(BTreeSet::new()),
                finished: Mutex::new(Vec::new()),
                running: AtomicUsize::new(0),
                max_running: AtomicUsize::new(0),
            }),
        }
    }

    /// Never looks at the cancel signal; only a release ends a job.
    pub fn ignoring_cancel(mut self) -> Self {
        self.honour_cancel = false;
        self
    }

    pub fn release(&self, n: usize) {
        self.state.gate.add_permits(n);
    }

    pub fn release_all(&self) {
        self.state.gate.close();
    }

    /// Wait until at least `n` jobs have entered the exporter.
    pub async fn wait_started(&self, n: usize) {
        let mut rx = self.state.started_count.subscribe();
        rx.wait_for(|count| *count >= n)
            .await
            .expect("exporter state outlives the test");
    }

    pub fn started(&self) -> Vec<String> {
        self.state.started.lock().unwrap().clone()
    }

    pub fn finished(&self) -> Vec<String> {
        self.state.finished.lock().unwrap().clone()
    }

    pub fn cancelled(&self) -> BTreeSet<String> {
        self.state.cancelled.lock().unwrap().clone()
    }

    pub fn running(&self) -> usize {
        self.state.running.load(Ordering::SeqCst)
    }

    pub fn max_running(&self) -> usize {
        self.state.max_running.load(Ordering::SeqCst)
    }
}

impl Exporter for ControllableExporter {
    fn program(&self) -> &str {
        &self.program
    }

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a> {
        Box::pin(async move {
            if request.dry_run {
                return Ok(JobOutput::default());
            }

            let name = request.job.name.clone();
            let state = &self.state;

            let now = state.running.fetch_add(1, Ordering::SeqCst) + 1;
            state.max_running.fetch_max(now, Ordering::SeqCst);
            state.started.lock().unwrap().push(name.clone());
            state.started_count.send_modify(|count| *count += 1);
            request.token.set_progress(0.5);

            let result = if self.honour_cancel {
                tokio::select! {
                    permit = state.gate.acquire() => {
                        if let Ok(permit) = permit {
                            permit.forget();
                        }
                        Ok(JobOutput::default())
                    }
                    _ = request.cancel.cancelled() => {
                        state.cancelled.lock().unwrap().insert(name.clone());
                        Err(ExportError::Cancelled)
                    }
                }
            } else {
                if let Ok(permit) = state.gate.acquire().await {
                    permit.forget();
                }
                Ok(JobOutput::default())
            };

            state.running.fetch_sub(1, Ordering::SeqCst);
            if result.is_ok() {
                state.finished.lock().unwrap().push(name);
            }
            result
        })
    }
}
