// src/bridge.rs

//! Blocking front-end for synchronous callers.
//!
//! A UI thread (or a plain `main`) cannot `.await`. [`ExecutionContext`]
//! owns the Tokio runtime the scheduler lives on and lets such a thread
//! submit a future and block until it resolves. [`BlockingRunner`] wraps a
//! [`Runner`] with that so every scheduler operation becomes an ordinary
//! function call.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::accumulator::ErrorAccumulator;
use crate::errors::{BridgeError, Result};
use crate::exporter::ExporterRegistry;
use crate::job::Job;
use crate::runner::{JobHandle, JobOutcome, Runner, RunnerOptions, RunnerState};
use crate::token::Token;

/// How long dropping a context waits for leftover tasks.
const RUNTIME_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// A multi-thread Tokio runtime driven from outside.
pub struct ExecutionContext {
    runtime: Option<Runtime>,
    handle: Handle,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("alive", &self.runtime.is_some())
            .finish()
    }
}

impl ExecutionContext {
    pub fn new() -> std::result::Result<Self, BridgeError> {
        Self::build(None)
    }

    /// Context with a fixed number of runtime worker threads.
    pub fn with_worker_threads(threads: usize) -> std::result::Result<Self, BridgeError> {
        Self::build(Some(threads.max(1)))
    }

    fn build(threads: Option<usize>) -> std::result::Result<Self, BridgeError> {
        let mut builder = Builder::new_multi_thread();
        builder.enable_all().thread_name("simrunner-worker");
        if let Some(threads) = threads {
            builder.worker_threads(threads);
        }

        let runtime = builder.build().map_err(BridgeError::Build)?;
        let handle = runtime.handle().clone();
        debug!("execution context started");

        Ok(Self {
            runtime: Some(runtime),
            handle,
        })
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Run `fut` on the context and block the calling thread until it
    /// resolves.
    ///
    /// Any thread with a current Tokio runtime is refused with
    /// [`BridgeError::NestedCall`]. That includes `spawn_blocking` threads,
    /// where blocking would be legal but cannot be told apart from a worker
    /// thread; code there should use `self.handle().block_on(fut)` instead.
    pub fn call<F, T>(&self, fut: F) -> std::result::Result<T, BridgeError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if Handle::try_current().is_ok() {
            return Err(BridgeError::NestedCall);
        }

        let (tx, rx) = oneshot::channel();
        self.handle.spawn(async move {
            let _ = tx.send(fut.await);
        });

        // A panicking task drops `tx` without sending.
        rx.blocking_recv().map_err(|_| BridgeError::TaskAborted)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        let Some(runtime) = self.runtime.take() else {
            return;
        };
        if Handle::try_current().is_ok() {
            runtime.shutdown_background();
        } else {
            runtime.shutdown_timeout(RUNTIME_SHUTDOWN_GRACE);
        }
        debug!("execution context stopped");
    }
}

/// A [`Runner`] usable from a synchronous thread.
///
/// Dropping it shuts the runner down (cancelling whatever is still queued
/// or running) before the runtime goes away.
#[derive(Debug)]
pub struct BlockingRunner {
    runner: Runner,
    context: ExecutionContext,
}

impl BlockingRunner {
    /// New runner on a fresh [`ExecutionContext`].
    pub fn new(options: RunnerOptions, exporters: ExporterRegistry) -> Result<Self> {
        let context = ExecutionContext::new()?;
        let runner = Runner::new(options, exporters)?;
        Ok(Self::with_context(context, runner))
    }

    pub fn with_context(context: ExecutionContext, runner: Runner) -> Self {
        Self { runner, context }
    }

    pub fn runner(&self) -> &Runner {
        &self.runner
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    pub fn start(&self) -> Result<()> {
        let _guard = self.context.handle().enter();
        self.runner.start()
    }

    pub fn submit(&self, jobs: Vec<Job>) -> Result<Vec<JobHandle>> {
        let runner = self.runner.clone();
        self.context.call(async move { runner.submit(jobs).await })?
    }

    pub fn cancel(&self) -> Result<()> {
        let runner = self.runner.clone();
        self.context.call(async move { runner.cancel().await })?
    }

    pub fn cancel_job(&self, handle: &JobHandle) -> Result<()> {
        let runner = self.runner.clone();
        let handle = handle.clone();
        self.context
            .call(async move { runner.cancel_job(&handle).await })?
    }

    pub fn shutdown(&self) -> Result<()> {
        let runner = self.runner.clone();
        self.context.call(async move { runner.shutdown().await })?
    }

    pub fn validate(&self, jobs: &[Job]) -> Result<ErrorAccumulator> {
        let runner = self.runner.clone();
        let jobs = jobs.to_vec();
        Ok(self
            .context
            .call(async move { runner.validate(&jobs).await })?)
    }

    pub fn validate_programs(
        &self,
        jobs: &[Job],
        programs: &[&str],
    ) -> Result<std::collections::BTreeMap<String, ErrorAccumulator>> {
        let runner = self.runner.clone();
        let jobs = jobs.to_vec();
        let programs: Vec<String> = programs.iter().map(|p| p.to_string()).collect();
        Ok(self.context.call(async move {
            let programs: Vec<&str> = programs.iter().map(String::as_str).collect();
            runner.validate_programs(&jobs, &programs).await
        })?)
    }

    /// Block until `handle`'s job has ended.
    pub fn wait(&self, handle: &JobHandle) -> Result<JobOutcome> {
        let handle = handle.clone();
        Ok(self.context.call(async move { handle.wait().await })?)
    }

    pub fn state(&self) -> RunnerState {
        self.runner.state()
    }

    pub fn token(&self) -> Token {
        self.runner.token()
    }

    pub fn progress(&self) -> f64 {
        self.runner.progress()
    }

    pub fn status(&self) -> String {
        self.runner.status()
    }

    pub fn submitted_count(&self) -> usize {
        self.runner.submitted_count()
    }

    pub fn done_count(&self) -> usize {
        self.runner.done_count()
    }
}

impl Drop for BlockingRunner {
    fn drop(&mut self) {
        if self.runner.state() == RunnerState::Stopped {
            return;
        }
        if Handle::try_current().is_ok() {
            warn!("blocking runner dropped inside an async context; jobs are abandoned");
            return;
        }
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "runner shutdown on drop failed");
        }
    }
}
