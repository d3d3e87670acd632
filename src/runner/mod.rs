// src/runner/mod.rs

//! Job scheduler.
//!
//! This module ties together:
//! - the pure dispatch state machine ([`dispatch`]): lifecycle, FIFO queue,
//!   concurrency bound
//! - the async loop around it ([`event_loop`]): spawns job tasks, relays
//!   cancellation, completes handles
//! - per-job result handles ([`handle`])
//! - the public [`Runner`] API ([`api`])

use std::path::PathBuf;
use std::time::Duration;

use crate::errors::{Result, SimRunnerError};

pub mod api;
pub mod dispatch;
pub(crate) mod event_loop;
pub mod handle;

pub use api::Runner;
pub use dispatch::{CoreCommand, DispatchCore, RunnerState};
pub use handle::{JobHandle, JobOutcome};

/// Settings passed explicitly to a [`Runner`].
#[derive(Debug, Clone)]
pub struct RunnerOptions {
    /// Jobs allowed to run at once. `None` means [`default_max_workers`].
    pub max_workers: Option<usize>,
    /// Directory exporters write job output into.
    pub workdir: PathBuf,
    /// Cancel any job still running after this long.
    pub job_timeout: Option<Duration>,
}

impl Default for RunnerOptions {
    fn default() -> Self {
        Self {
            max_workers: None,
            workdir: PathBuf::from("simrunner-output"),
            job_timeout: None,
        }
    }
}

impl RunnerOptions {
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = Some(max_workers);
        self
    }

    pub fn with_workdir(mut self, workdir: impl Into<PathBuf>) -> Self {
        self.workdir = workdir.into();
        self
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    /// Effective worker count. An explicit 0 is an error.
    pub fn resolved_max_workers(&self) -> Result<usize> {
        match self.max_workers {
            Some(0) => Err(SimRunnerError::InvalidMaxWorkers(0)),
            Some(n) => Ok(n),
            None => Ok(default_max_workers()),
        }
    }
}

/// One fewer than the number of CPUs, leaving room for the coordinating
/// thread; never less than 1.
pub fn default_max_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .saturating_sub(1)
        .max(1)
}
