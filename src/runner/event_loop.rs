// src/runner/event_loop.rs

//! Async shell around [`DispatchCore`].
//!
//! The loop runs as a single Tokio task on the runner's execution context.
//! It is the only place that touches the core, the job table and the
//! cancel/shutdown waiters, so none of them need locking. Everything else
//! (callers, job tasks, timeout timers) talks to it through
//! [`RunnerEvent`]s.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::accumulator::ErrorAccumulator;
use crate::errors::{ExportError, Result, SimRunnerError};
use crate::exporter::{ExportRequest, Exporter, ExporterRegistry};
use crate::job::{Job, JobId};
use crate::token::{SIMULATION_CATEGORY, Token, TokenState};

use super::dispatch::{CoreCommand, DispatchCore, RunnerState};
use super::handle::{JobHandle, JobOutcome};

/// Events flowing into the runner loop from callers and job tasks.
pub(crate) enum RunnerEvent {
    Submit {
        jobs: Vec<Job>,
        reply: oneshot::Sender<Result<Vec<JobHandle>>>,
    },
    /// A job task ended (successfully, with an error, or cancelled).
    JobFinished { id: JobId, outcome: JobOutcome },
    CancelAll { reply: oneshot::Sender<()> },
    /// Cancel one job. Timeouts send this without a reply.
    CancelJob {
        id: JobId,
        reply: Option<oneshot::Sender<()>>,
    },
    Shutdown { reply: oneshot::Sender<()> },
}

/// Static settings the loop needs for every job.
pub(crate) struct LoopSettings {
    pub max_workers: usize,
    pub workdir: PathBuf,
    pub job_timeout: Option<Duration>,
}

/// Bookkeeping for a job that has not reached a terminal state yet.
struct JobEntry {
    job: Arc<Job>,
    handle: JobHandle,
    cancel: CancellationToken,
    timer: Option<JoinHandle<()>>,
}

/// A `cancel()` / `cancel_job()` caller waiting for its jobs to settle.
struct CancelWaiter {
    remaining: BTreeSet<JobId>,
    reply: oneshot::Sender<()>,
}

pub(crate) struct EventLoop {
    core: DispatchCore,
    settings: LoopSettings,
    exporters: ExporterRegistry,
    root: Token,
    state: Arc<watch::Sender<RunnerState>>,
    events_tx: mpsc::Sender<RunnerEvent>,
    events_rx: mpsc::Receiver<RunnerEvent>,
    next_id: u64,
    jobs: HashMap<JobId, JobEntry>,
    cancel_waiters: Vec<CancelWaiter>,
    shutdown_waiters: Vec<oneshot::Sender<()>>,
}

impl EventLoop {
    pub(crate) fn new(
        settings: LoopSettings,
        exporters: ExporterRegistry,
        root: Token,
        state: Arc<watch::Sender<RunnerState>>,
        events_tx: mpsc::Sender<RunnerEvent>,
        events_rx: mpsc::Receiver<RunnerEvent>,
    ) -> Self {
        let mut core = DispatchCore::new(settings.max_workers);
        core.start();

        Self {
            core,
            settings,
            exporters,
            root,
            state,
            events_tx,
            events_rx,
            next_id: 0,
            jobs: HashMap::new(),
            cancel_waiters: Vec::new(),
            shutdown_waiters: Vec::new(),
        }
    }

    /// Main event loop. Returns once shutdown has completed.
    pub(crate) async fn run(mut self) {
        info!(max_workers = self.core.max_workers(), "runner loop started");
        self.refresh_status();

        while let Some(event) = self.events_rx.recv().await {
            self.handle_event(event);
            self.refresh_status();

            if self.core.state() == RunnerState::Stopped {
                break;
            }
        }

        info!("runner loop finished");
    }

    fn handle_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Submit { jobs, reply } => {
                let result = self.submit(jobs);
                if reply.send(result).is_err() {
                    debug!("submitter went away before the reply");
                }
            }
            RunnerEvent::JobFinished { id, outcome } => self.job_finished(id, outcome),
            RunnerEvent::CancelAll { reply } => self.cancel_all(reply),
            RunnerEvent::CancelJob { id, reply } => self.cancel_job(id, reply),
            RunnerEvent::Shutdown { reply } => self.shutdown(reply),
        }
    }

    fn submit(&mut self, jobs: Vec<Job>) -> Result<Vec<JobHandle>> {
        if !self.core.is_accepting() {
            return Err(SimRunnerError::Stopped);
        }

        let mut handles = Vec::with_capacity(jobs.len());
        let mut ids = Vec::with_capacity(jobs.len());

        for job in jobs {
            let id = JobId(self.next_id);
            self.next_id += 1;

            let token = self.root.add_subtoken(Some(SIMULATION_CATEGORY));
            token.set_status("Queued");

            let handle = JobHandle::new(id, job.name.clone(), job.program.clone(), token);
            debug!(job = %job.name, job_id = %id, program = %job.program, "job submitted");

            self.jobs.insert(
                id,
                JobEntry {
                    job: Arc::new(job),
                    handle: handle.clone(),
                    cancel: CancellationToken::new(),
                    timer: None,
                },
            );
            ids.push(id);
            handles.push(handle);
        }

        info!(count = handles.len(), "submitted jobs");
        let commands = self.core.enqueue(ids);
        self.execute(commands);
        Ok(handles)
    }

    fn job_finished(&mut self, id: JobId, outcome: JobOutcome) {
        match self.jobs.remove(&id) {
            Some(entry) => {
                if let Some(timer) = entry.timer {
                    timer.abort();
                }
                info!(job = %entry.job.name, job_id = %id, outcome = %outcome, "job finished");
                entry.handle.complete(outcome);
            }
            None => warn!(job_id = %id, "finish for unknown job; ignoring"),
        }

        let commands = self.core.finished(id);
        self.execute(commands);
        self.settle_waiters(id);
    }

    fn cancel_all(&mut self, reply: oneshot::Sender<()>) {
        let affected: BTreeSet<JobId> = self.jobs.keys().copied().collect();
        info!(jobs = affected.len(), "cancelling all jobs");

        let commands = self.core.cancel_all();
        self.execute(commands);
        self.wait_for(affected, reply);
    }

    fn cancel_job(&mut self, id: JobId, reply: Option<oneshot::Sender<()>>) {
        if self.jobs.contains_key(&id) {
            info!(job_id = %id, "cancelling job");
            let commands = self.core.cancel_one(id);
            self.execute(commands);
        }

        if let Some(reply) = reply {
            self.wait_for(BTreeSet::from([id]), reply);
        }
    }

    fn shutdown(&mut self, reply: oneshot::Sender<()>) {
        self.shutdown_waiters.push(reply);

        if self.core.state() == RunnerState::Started {
            info!(
                running = self.core.running_count(),
                queued = self.core.queued_count(),
                "runner shutting down"
            );
        }

        let commands = self.core.begin_shutdown();
        self.publish_state();
        self.execute(commands);
    }

    fn execute(&mut self, commands: Vec<CoreCommand>) {
        for command in commands {
            match command {
                CoreCommand::StartJob(id) => self.start_job(id),
                CoreCommand::CancelQueued(id) => self.cancel_queued(id),
                CoreCommand::SignalCancel(id) => self.signal_cancel(id),
                CoreCommand::Stopped => self.stopped(),
            }
        }
    }

    fn start_job(&mut self, id: JobId) {
        let Some(entry) = self.jobs.get_mut(&id) else {
            warn!(job_id = %id, "start for unknown job; ignoring");
            return;
        };

        debug!(job = %entry.job.name, job_id = %id, "dispatching job to worker slot");

        let exporter = self.exporters.get(&entry.job.program);
        tokio::spawn(run_job(
            id,
            Arc::clone(&entry.job),
            exporter,
            self.settings.workdir.clone(),
            entry.handle.token().clone(),
            entry.cancel.clone(),
            self.events_tx.clone(),
        ));

        if let Some(limit) = self.settings.job_timeout {
            let tx = self.events_tx.clone();
            let job_name = entry.job.name.clone();
            entry.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(limit).await;
                warn!(job = %job_name, job_id = %id, ?limit, "job timed out; cancelling");
                let _ = tx.send(RunnerEvent::CancelJob { id, reply: None }).await;
            }));
        }
    }

    fn cancel_queued(&mut self, id: JobId) {
        let Some(entry) = self.jobs.remove(&id) else {
            return;
        };

        let token = entry.handle.token();
        token.set_state(TokenState::Cancelled);
        token.set_status("Cancelled");
        debug!(job = %entry.job.name, job_id = %id, "queued job cancelled before start");
        entry.handle.complete(JobOutcome::Cancelled);

        self.settle_waiters(id);
    }

    fn signal_cancel(&mut self, id: JobId) {
        if let Some(entry) = self.jobs.get(&id) {
            if !entry.cancel.is_cancelled() {
                entry.handle.token().set_status("Cancelling");
                entry.cancel.cancel();
                debug!(job = %entry.job.name, job_id = %id, "cancel signal sent to running job");
            }
        }
    }

    fn stopped(&mut self) {
        info!("all jobs terminal; runner stopped");
        self.publish_state();

        for waiter in self.cancel_waiters.drain(..) {
            let _ = waiter.reply.send(());
        }
        for reply in self.shutdown_waiters.drain(..) {
            let _ = reply.send(());
        }
    }

    /// Reply now if none of `ids` is still outstanding, otherwise park the
    /// reply until they are.
    fn wait_for(&mut self, ids: BTreeSet<JobId>, reply: oneshot::Sender<()>) {
        let remaining: BTreeSet<JobId> = ids
            .into_iter()
            .filter(|id| self.jobs.contains_key(id))
            .collect();

        if remaining.is_empty() {
            let _ = reply.send(());
        } else {
            self.cancel_waiters.push(CancelWaiter { remaining, reply });
        }
    }

    fn settle_waiters(&mut self, id: JobId) {
        let mut pending = Vec::with_capacity(self.cancel_waiters.len());
        for mut waiter in self.cancel_waiters.drain(..) {
            waiter.remaining.remove(&id);
            if waiter.remaining.is_empty() {
                let _ = waiter.reply.send(());
            } else {
                pending.push(waiter);
            }
        }
        self.cancel_waiters = pending;
    }

    fn publish_state(&self) {
        self.state.send_replace(self.core.state());
    }

    fn refresh_status(&self) {
        let running = self.core.running_count();
        let queued = self.core.queued_count();

        let status = match self.core.state() {
            RunnerState::Stopping => format!("Stopping ({running} running)"),
            RunnerState::Stopped => "Stopped".to_string(),
            _ if running == 0 && queued == 0 => "Idle".to_string(),
            _ => format!("{running} running, {queued} queued"),
        };

        if self.root.status().as_deref() != Some(status.as_str()) {
            self.root.set_status(status);
        }
    }
}

/// Body of one job's task: run the exporter and report back to the loop.
async fn run_job(
    id: JobId,
    job: Arc<Job>,
    exporter: Option<Arc<dyn Exporter>>,
    workdir: PathBuf,
    token: Token,
    cancel: CancellationToken,
    events: mpsc::Sender<RunnerEvent>,
) {
    let outcome = execute_job(&job, exporter, workdir, &token, &cancel).await;

    if events
        .send(RunnerEvent::JobFinished { id, outcome })
        .await
        .is_err()
    {
        warn!(job = %job.name, job_id = %id, "runner loop gone; dropping job outcome");
    }
}

async fn execute_job(
    job: &Arc<Job>,
    exporter: Option<Arc<dyn Exporter>>,
    workdir: PathBuf,
    token: &Token,
    cancel: &CancellationToken,
) -> JobOutcome {
    if cancel.is_cancelled() {
        token.set_state(TokenState::Cancelled);
        token.set_status("Cancelled");
        return JobOutcome::Cancelled;
    }

    token.set_state(TokenState::Running);
    token.set_status("Running");

    let Some(exporter) = exporter else {
        let err = ExportError::UnknownProgram(job.program.clone());
        error!(job = %job.name, error = %err, "cannot run job");
        return fail(token, err);
    };

    // The exporter runs in its own task so that a panic stays inside this
    // job.
    let export = tokio::spawn({
        let job = Arc::clone(job);
        let token = token.clone();
        let cancel = cancel.clone();
        async move {
            let mut errors = ErrorAccumulator::new();
            exporter
                .export(ExportRequest {
                    job: &job,
                    workdir: &workdir,
                    errors: &mut errors,
                    dry_run: false,
                    token: &token,
                    cancel: &cancel,
                })
                .await
        }
    });

    match export.await {
        Ok(Ok(output)) => {
            token.set_progress(1.0);
            token.set_state(TokenState::Done);
            token.set_status("Done");
            JobOutcome::Success(output)
        }
        Ok(Err(ExportError::Cancelled)) => {
            token.set_state(TokenState::Cancelled);
            token.set_status("Cancelled");
            JobOutcome::Cancelled
        }
        Ok(Err(err)) => {
            error!(job = %job.name, error = %err, "job failed");
            fail(token, err)
        }
        Err(join_err) => {
            let message = if join_err.is_panic() {
                panic_message(join_err.into_panic())
            } else {
                join_err.to_string()
            };
            error!(job = %job.name, panic = %message, "exporter panicked");
            fail(token, ExportError::Panicked(message))
        }
    }
}

fn fail(token: &Token, err: ExportError) -> JobOutcome {
    token.set_state(TokenState::Done);
    token.set_status(format!("Failed: {err}"));
    JobOutcome::Failed(Arc::new(err))
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
