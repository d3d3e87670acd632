// src/exporter/mod.rs

//! Pluggable exporter abstraction.
//!
//! The runner never runs a simulation program itself; it hands each job to
//! the [`Exporter`] registered for the job's program. This makes it easy to
//! swap in fake exporters in tests while keeping the production adapter in
//! [`command`].
//!
//! - [`command`] contains [`CommandExporter`], which runs an external
//!   program with `tokio::process`.
//! - [`progress`] parses progress lines from a program's stdout.
//!
//! # Cancellation contract
//!
//! Cancellation is cooperative. Every exporter receives a
//! [`CancellationToken`] in its [`ExportRequest`] and must check it at
//! bounded intervals (or `select!` on `cancelled()`). When it fires, the
//! exporter stops, removes any partial output and returns
//! [`ExportError::Cancelled`]. An exporter that ignores the token makes
//! `Runner::cancel()` and `Runner::shutdown()` wait for the job to finish on
//! its own.

pub mod command;
pub mod progress;

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::accumulator::ErrorAccumulator;
use crate::config::ConfigFile;
use crate::errors::{ExportError, Result};
use crate::job::{Job, JobOutput};
use crate::token::Token;

pub use command::CommandExporter;

/// Future returned by [`Exporter::export`].
pub type ExportFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<JobOutput, ExportError>> + Send + 'a>>;

/// Everything an exporter gets for one job.
pub struct ExportRequest<'a> {
    pub job: &'a Job,
    /// Directory the exporter writes into (a scratch directory on dry runs).
    pub workdir: &'a Path,
    /// Where every non-fatal problem goes.
    pub errors: &'a mut ErrorAccumulator,
    /// Validate only; no user-visible output.
    pub dry_run: bool,
    /// The job's own token. Exporters report progress and status here.
    pub token: &'a Token,
    pub cancel: &'a CancellationToken,
}

/// Trait abstracting how a program runs (or dry-runs) a job.
///
/// One exporter instance is shared by every job of its program, so
/// implementations keep no per-job state.
pub trait Exporter: Send + Sync {
    /// Name of the program this exporter drives.
    fn program(&self) -> &str;

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a>;
}

/// Exporters keyed by program name.
#[derive(Clone, Default)]
pub struct ExporterRegistry {
    exporters: BTreeMap<String, Arc<dyn Exporter>>,
}

impl fmt::Debug for ExporterRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterRegistry")
            .field("programs", &self.exporters.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl ExporterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a [`CommandExporter`] for every `[program.<name>]` section.
    pub fn from_config(cfg: &ConfigFile) -> Result<Self> {
        let mut registry = Self::new();
        for (name, program) in cfg.program.iter() {
            registry.register(CommandExporter::from_config(name, program)?);
        }
        Ok(registry)
    }

    /// Register an exporter under its own program name, replacing any
    /// previous one.
    pub fn register<E>(&mut self, exporter: E) -> &mut Self
    where
        E: Exporter + 'static,
    {
        self.register_shared(Arc::new(exporter))
    }

    pub fn register_shared(&mut self, exporter: Arc<dyn Exporter>) -> &mut Self {
        self.exporters
            .insert(exporter.program().to_string(), exporter);
        self
    }

    pub fn with<E>(mut self, exporter: E) -> Self
    where
        E: Exporter + 'static,
    {
        self.register(exporter);
        self
    }

    pub fn get(&self, program: &str) -> Option<Arc<dyn Exporter>> {
        self.exporters.get(program).cloned()
    }

    pub fn programs(&self) -> impl Iterator<Item = &str> {
        self.exporters.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.exporters.is_empty()
    }
}
