// src/runner/api.rs

//! Public async API of the scheduler.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{ErrorAccumulator, Issue};
use crate::errors::{Result, SimRunnerError};
use crate::exporter::{ExportRequest, ExporterRegistry};
use crate::job::Job;
use crate::token::{PROJECT_CATEGORY, SIMULATION_CATEGORY, Token, TokenState};

use super::RunnerOptions;
use super::dispatch::RunnerState;
use super::event_loop::{EventLoop, LoopSettings, RunnerEvent};
use super::handle::JobHandle;

/// Capacity of the runner's event channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

struct RunnerInner {
    options: RunnerOptions,
    max_workers: usize,
    exporters: ExporterRegistry,
    root: Token,
    state: Arc<watch::Sender<RunnerState>>,
    events: Mutex<Option<mpsc::Sender<RunnerEvent>>>,
}

impl RunnerInner {
    fn events(&self) -> MutexGuard<'_, Option<mpsc::Sender<RunnerEvent>>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Schedules simulation jobs with bounded parallelism.
///
/// `Runner` is a cheap, clonable handle. All coordination happens in one
/// loop task on the Tokio runtime that was current when [`start`] was
/// called; the methods here only exchange messages with it. For callers on
/// a plain thread, see [`crate::bridge::BlockingRunner`].
///
/// [`start`]: Runner::start
#[derive(Clone)]
pub struct Runner {
    inner: Arc<RunnerInner>,
}

impl fmt::Debug for Runner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runner")
            .field("state", &self.state())
            .field("max_workers", &self.inner.max_workers)
            .field("exporters", &self.inner.exporters)
            .finish_non_exhaustive()
    }
}

impl Runner {
    /// Create a runner in the `Created` state, with an empty root token.
    pub fn new(options: RunnerOptions, exporters: ExporterRegistry) -> Result<Self> {
        let max_workers = options.resolved_max_workers()?;
        let (state, _) = watch::channel(RunnerState::Created);

        Ok(Self {
            inner: Arc::new(RunnerInner {
                options,
                max_workers,
                exporters,
                root: Token::new(Some(PROJECT_CATEGORY)),
                state: Arc::new(state),
                events: Mutex::new(None),
            }),
        })
    }

    /// Start the runner loop on the current Tokio runtime.
    ///
    /// Calling it again on a started runner does nothing. Fails with
    /// [`SimRunnerError::NoExecutionContext`] outside a runtime, and with
    /// [`SimRunnerError::Stopped`] once the runner has been shut down.
    pub fn start(&self) -> Result<()> {
        let mut events = self.inner.events();

        match self.state() {
            RunnerState::Started => return Ok(()),
            RunnerState::Stopping | RunnerState::Stopped => return Err(SimRunnerError::Stopped),
            RunnerState::Created => {}
        }

        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|_| SimRunnerError::NoExecutionContext)?;

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let event_loop = EventLoop::new(
            LoopSettings {
                max_workers: self.inner.max_workers,
                workdir: self.inner.options.workdir.clone(),
                job_timeout: self.inner.options.job_timeout,
            },
            self.inner.exporters.clone(),
            self.inner.root.clone(),
            Arc::clone(&self.inner.state),
            tx.clone(),
            rx,
        );
        runtime.spawn(event_loop.run());

        *events = Some(tx);
        self.inner.state.send_replace(RunnerState::Started);
        info!(max_workers = self.inner.max_workers, "runner started");
        Ok(())
    }

    pub fn state(&self) -> RunnerState {
        *self.inner.state.borrow()
    }

    /// Watch lifecycle changes.
    pub fn subscribe_state(&self) -> watch::Receiver<RunnerState> {
        self.inner.state.subscribe()
    }

    pub fn max_workers(&self) -> usize {
        self.inner.max_workers
    }

    pub fn exporters(&self) -> &ExporterRegistry {
        &self.inner.exporters
    }

    /// Root token: one `simulation` child per submitted job.
    pub fn token(&self) -> Token {
        self.inner.root.clone()
    }

    /// Submit jobs. One child token is created per job, in argument order,
    /// and jobs are dispatched in that order as worker slots free up.
    pub async fn submit<I>(&self, jobs: I) -> Result<Vec<JobHandle>>
    where
        I: IntoIterator<Item = Job>,
    {
        let jobs: Vec<Job> = jobs.into_iter().collect();
        let tx = self.sender()?;

        let (reply, rx) = oneshot::channel();
        tx.send(RunnerEvent::Submit { jobs, reply })
            .await
            .map_err(|_| SimRunnerError::Stopped)?;
        rx.await.map_err(|_| SimRunnerError::Stopped)?
    }

    /// Cancel every job that has not ended yet.
    ///
    /// Queued jobs are cancelled without ever reaching their exporter;
    /// running jobs are asked to stop. Resolves once all of them are
    /// terminal. Safe to call repeatedly and when nothing is running.
    pub async fn cancel(&self) -> Result<()> {
        let Some(tx) = self.sender_if_running() else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        if tx.send(RunnerEvent::CancelAll { reply }).await.is_err() {
            // Loop already stopped: every job is terminal.
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Cancel one job and wait until it is terminal.
    pub async fn cancel_job(&self, handle: &JobHandle) -> Result<()> {
        if handle.is_done() {
            return Ok(());
        }
        let Some(tx) = self.sender_if_running() else {
            return Ok(());
        };

        let (reply, rx) = oneshot::channel();
        let event = RunnerEvent::CancelJob {
            id: handle.id(),
            reply: Some(reply),
        };
        if tx.send(event).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    /// Stop accepting jobs, cancel whatever is queued or running, and wait
    /// until everything is terminal. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let tx = {
            let events = self.inner.events();
            match self.state() {
                RunnerState::Stopped => return Ok(()),
                RunnerState::Created => {
                    self.inner.state.send_replace(RunnerState::Stopped);
                    info!("runner stopped before it was started");
                    return Ok(());
                }
                RunnerState::Started | RunnerState::Stopping => events.clone(),
            }
        };

        if let Some(tx) = tx {
            let (reply, rx) = oneshot::channel();
            if tx.send(RunnerEvent::Shutdown { reply }).await.is_ok() {
                let _ = rx.await;
            }
        }

        // Anything still holding the sender now sees a stopped runner.
        self.inner.events().take();
        self.inner.state.send_replace(RunnerState::Stopped);
        Ok(())
    }

    /// Dry-run `jobs` through their exporters and collect every problem.
    ///
    /// Runs in a scratch directory that is removed afterwards. Creates no
    /// tokens and takes no worker slots, so it works in any runner state.
    pub async fn validate(&self, jobs: &[Job]) -> ErrorAccumulator {
        let mut errors = ErrorAccumulator::new();

        let scratch = match tempfile::Builder::new()
            .prefix("simrunner-dry-run-")
            .tempdir()
        {
            Ok(dir) => dir,
            Err(e) => {
                errors.add_exception(Issue::new(
                    "dry-run",
                    format!("cannot create scratch directory: {e}"),
                ));
                return errors;
            }
        };

        for job in jobs {
            let Some(exporter) = self.inner.exporters.get(&job.program) else {
                errors.add_exception(Issue::new(
                    &job.name,
                    format!("no exporter registered for program '{}'", job.program),
                ));
                continue;
            };

            // Scratch tokens: never attached to the root.
            let token = Token::new(Some(SIMULATION_CATEGORY));
            let cancel = CancellationToken::new();
            let result = exporter
                .export(ExportRequest {
                    job,
                    workdir: scratch.path(),
                    errors: &mut errors,
                    dry_run: true,
                    token: &token,
                    cancel: &cancel,
                })
                .await;

            if let Err(e) = result {
                errors.add_exception(Issue::new(&job.name, e.to_string()));
            }
        }

        debug!(
            jobs = jobs.len(),
            exceptions = errors.exceptions().len(),
            warnings = errors.warnings().len(),
            "dry run finished"
        );
        if let Err(e) = scratch.close() {
            warn!(error = %e, "failed to remove dry-run scratch directory");
        }
        errors
    }

    /// For each program, would it accept every one of `jobs`?
    ///
    /// Each job's options are re-targeted at the program and dry-run; the
    /// result maps program name to its own accumulator.
    pub async fn validate_programs(
        &self,
        jobs: &[Job],
        programs: &[&str],
    ) -> BTreeMap<String, ErrorAccumulator> {
        let mut results = BTreeMap::new();
        for program in programs {
            let retargeted: Vec<Job> = jobs.iter().map(|job| job.for_program(program)).collect();
            let errors = self.validate(&retargeted).await;
            results.insert(program.to_string(), errors);
        }
        results
    }

    /// Number of jobs submitted since the runner was created.
    pub fn submitted_count(&self) -> usize {
        self.inner
            .root
            .count_subtokens(Some(SIMULATION_CATEGORY), |_| true)
    }

    /// Number of submitted jobs that have ended, whatever the outcome.
    pub fn done_count(&self) -> usize {
        self.inner
            .root
            .count_subtokens(Some(SIMULATION_CATEGORY), TokenState::is_terminal)
    }

    /// Aggregate progress over all submitted jobs.
    pub fn progress(&self) -> f64 {
        self.inner.root.progress()
    }

    /// Status line, e.g. `"2 running, 3 queued"`.
    pub fn status(&self) -> String {
        self.inner.root.status().unwrap_or_else(|| "Idle".to_string())
    }

    fn sender(&self) -> Result<mpsc::Sender<RunnerEvent>> {
        let events = self.inner.events();
        match self.state() {
            RunnerState::Created => Err(SimRunnerError::NotStarted),
            RunnerState::Stopping | RunnerState::Stopped => Err(SimRunnerError::Stopped),
            RunnerState::Started => events.clone().ok_or(SimRunnerError::NotStarted),
        }
    }

    fn sender_if_running(&self) -> Option<mpsc::Sender<RunnerEvent>> {
        let events = self.inner.events();
        match self.state() {
            RunnerState::Started | RunnerState::Stopping => events.clone(),
            RunnerState::Created | RunnerState::Stopped => None,
        }
    }
}
