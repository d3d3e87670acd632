// src/lib.rs

pub mod accumulator;
pub mod bridge;
pub mod cli;
pub mod config;
pub mod errors;
pub mod exporter;
pub mod job;
pub mod logging;
pub mod runner;
pub mod token;

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tracing::{debug, info, warn};

use crate::accumulator::ErrorAccumulator;
use crate::bridge::BlockingRunner;
use crate::cli::CliArgs;
use crate::config::{ConfigFile, load_and_validate};
use crate::exporter::ExporterRegistry;
use crate::job::Job;
use crate::runner::{JobHandle, JobOutcome};

pub use crate::accumulator::Issue;
pub use crate::errors::{ExportError, SimRunnerError};
pub use crate::exporter::{ExportRequest, Exporter};
pub use crate::runner::{Runner, RunnerOptions, RunnerState};
pub use crate::token::{Token, TokenState};

/// What a `run` did, for the exit status and the final report.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Jobs rejected by the dry run and never submitted.
    pub invalid: usize,
    pub submitted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub cancelled: usize,
}

impl RunSummary {
    /// No invalid and no failed jobs. Cancelled jobs do not count against
    /// a run.
    pub fn is_clean(&self) -> bool {
        self.invalid == 0 && self.failed == 0
    }

    fn record(&mut self, outcome: &JobOutcome) {
        match outcome {
            JobOutcome::Success(_) => self.succeeded += 1,
            JobOutcome::Failed(_) => self.failed += 1,
            JobOutcome::Cancelled => self.cancelled += 1,
        }
    }
}

/// High-level entry point used by `main.rs`.
///
/// Runs entirely on the calling thread through [`BlockingRunner`], the way
/// a UI front-end would:
/// - config loading and exporter setup
/// - dry-run validation of every selected job
/// - submission of the valid ones
/// - a polling loop that reports progress until all jobs have ended
/// - Ctrl-C handling (cancels every job)
pub fn run(args: CliArgs) -> Result<RunSummary> {
    let config_path = PathBuf::from(&args.config);
    let cfg = load_and_validate(&config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let exporters = ExporterRegistry::from_config(&cfg)?;
    let mut options = cfg.runner_options();
    if let Some(max_workers) = args.max_workers {
        options.max_workers = Some(max_workers);
    }

    let jobs = select_jobs(&cfg, &args.only)?;
    let runner = BlockingRunner::new(options, exporters)?;

    let report = runner.validate(&jobs)?;
    print_issues(&report);

    let (valid, invalid): (Vec<Job>, Vec<Job>) = jobs
        .into_iter()
        .partition(|job| !report.has_exceptions_for(&job.name));
    let mut summary = RunSummary {
        invalid: invalid.len(),
        ..RunSummary::default()
    };

    if args.dry_run {
        print_dry_run(&cfg, &valid, &invalid);
        runner.shutdown()?;
        return Ok(summary);
    }

    if valid.is_empty() {
        warn!("no valid jobs to run");
        runner.shutdown()?;
        return Ok(summary);
    }

    runner.start()?;
    install_ctrl_c_handler(&runner);

    let handles = runner.submit(valid)?;
    summary.submitted = handles.len();
    info!(jobs = handles.len(), "jobs submitted");

    poll_until_done(&runner, &handles, cfg.runner.poll_interval);
    runner.shutdown()?;

    for handle in &handles {
        let outcome = runner.wait(handle)?;
        print_outcome(handle, &outcome);
        summary.record(&outcome);
    }

    println!(
        "{} succeeded, {} failed, {} cancelled, {} invalid",
        summary.succeeded, summary.failed, summary.cancelled, summary.invalid
    );
    Ok(summary)
}

/// All jobs from the config, narrowed to `only` when it is non-empty.
fn select_jobs(cfg: &ConfigFile, only: &[String]) -> Result<Vec<Job>> {
    let jobs = cfg.jobs();
    if only.is_empty() {
        return Ok(jobs);
    }

    let wanted: BTreeSet<&str> = only.iter().map(String::as_str).collect();
    for name in &wanted {
        if !cfg.job.contains_key(*name) {
            bail!("--only names unknown job '{name}'");
        }
    }

    Ok(jobs
        .into_iter()
        .filter(|job| wanted.contains(job.name.as_str()))
        .collect())
}

/// Cancel every job on Ctrl-C. The listener lives on the runner's
/// execution context.
fn install_ctrl_c_handler(runner: &BlockingRunner) {
    let inner = runner.runner().clone();
    runner.context().handle().spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for Ctrl+C");
            return;
        }
        warn!("Ctrl+C received; cancelling all jobs");
        if let Err(e) = inner.cancel().await {
            warn!(error = %e, "cancel after Ctrl+C failed");
        }
    });
}

fn poll_until_done(runner: &BlockingRunner, handles: &[JobHandle], interval: Duration) {
    let mut last_line = String::new();
    loop {
        let line = format!(
            "[{}/{}] {:5.1}% {}",
            runner.done_count(),
            runner.submitted_count(),
            runner.progress() * 100.0,
            runner.status()
        );
        if line != last_line {
            println!("{line}");
            last_line = line;
        }

        if handles.iter().all(JobHandle::is_done) {
            break;
        }
        std::thread::sleep(interval);
    }
    debug!("all submitted jobs have ended");
}

fn print_issues(report: &ErrorAccumulator) {
    for issue in report.exceptions() {
        println!("error: {issue}");
    }
    for issue in report.warnings() {
        println!("warning: {issue}");
    }
}

fn print_outcome(handle: &JobHandle, outcome: &JobOutcome) {
    match outcome.output().and_then(|o| o.output_dir.as_ref()) {
        Some(dir) => println!("  {}: {} ({})", handle.name(), outcome, dir.display()),
        None => println!("  {}: {}", handle.name(), outcome),
    }
}

fn print_dry_run(cfg: &ConfigFile, valid: &[Job], invalid: &[Job]) {
    println!("simrunner dry-run");
    match cfg.runner.max_workers {
        Some(n) => println!("  runner.max_workers = {n}"),
        None => println!(
            "  runner.max_workers = {} (default)",
            runner::default_max_workers()
        ),
    }
    println!("  runner.workdir = {}", cfg.runner.workdir.display());
    if let Some(limit) = cfg.runner.job_timeout {
        println!("  runner.job_timeout = {limit:?}");
    }
    println!();

    println!("programs ({}):", cfg.program.len());
    for (name, program) in cfg.program.iter() {
        println!("  - {name}");
        println!("      cmd: {}", program.cmd);
        if !program.args.is_empty() {
            println!("      args: {:?}", program.args);
        }
        if !program.required.is_empty() {
            println!("      required: {:?}", program.required);
        }
        if !program.optional.is_empty() {
            println!("      optional: {:?}", program.optional);
        }
        if let Some(ref pattern) = program.progress_pattern {
            println!("      progress_pattern: {pattern}");
        }
    }
    println!();

    println!("jobs ({} valid, {} invalid):", valid.len(), invalid.len());
    for job in valid {
        println!("  - {} [{}]", job.name, job.program);
    }
    for job in invalid {
        println!("  - {} [{}] INVALID", job.name, job.program);
    }

    debug!("dry-run complete (no execution)");
}
