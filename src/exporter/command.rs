// src/exporter/command.rs

//! Exporter that runs a simulation program as an external process.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accumulator::{ErrorAccumulator, Issue};
use crate::config::ProgramConfig;
use crate::errors::{ExportError, Result, SimRunnerError};
use crate::exporter::progress::spawn_stdout_monitor;
use crate::exporter::{ExportFuture, ExportRequest, Exporter};
use crate::job::{Job, JobOutput};
use crate::token::Token;

/// Environment variable holding the job's (partial) output directory.
pub const OUTPUT_ENV: &str = "SIMRUNNER_OUTPUT";

/// Prefix of the environment variables carrying job options.
pub const OPTION_ENV_PREFIX: &str = "SIMRUNNER_OPT_";

/// Runs `cmd args...` once per job.
///
/// - Options are passed as `SIMRUNNER_OPT_<KEY>` environment variables.
/// - Output goes to `<workdir>/<job>.<token id>.partial`, which is renamed
///   to `<workdir>/<job>` only when the program exits successfully. On
///   failure or cancellation the partial directory is removed, so an output
///   directory always means a complete run.
/// - Jobs sharing a name never share a partial directory. The last one to
///   finish owns `<workdir>/<job>`.
/// - Cancellation kills the process; that is this exporter's
///   acknowledgement of the runner's cancel signal.
#[derive(Debug, Clone)]
pub struct CommandExporter {
    program: String,
    cmd: String,
    args: Vec<String>,
    required: Vec<String>,
    optional: Vec<String>,
    progress_pattern: Option<Regex>,
    /// Serializes replacing `<workdir>/<job>` across concurrent jobs.
    publish_lock: Arc<Mutex<()>>,
}

impl CommandExporter {
    pub fn new(program: impl Into<String>, cmd: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            cmd: cmd.into(),
            args: Vec::new(),
            required: Vec::new(),
            optional: Vec::new(),
            progress_pattern: None,
            publish_lock: Arc::default(),
        }
    }

    pub fn from_config(program: &str, cfg: &ProgramConfig) -> Result<Self> {
        let progress_pattern = cfg
            .progress_pattern
            .as_deref()
            .map(Regex::new)
            .transpose()
            .map_err(|e| {
                SimRunnerError::ConfigError(format!(
                    "program '{}' has an invalid progress_pattern: {}",
                    program, e
                ))
            })?;

        Ok(Self {
            program: program.to_string(),
            cmd: cfg.cmd.clone(),
            args: cfg.args.clone(),
            required: cfg.required.clone(),
            optional: cfg.optional.clone(),
            progress_pattern,
            publish_lock: Arc::default(),
        })
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_required<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_optional<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.optional = keys.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_progress_pattern(mut self, pattern: Regex) -> Self {
        self.progress_pattern = Some(pattern);
        self
    }

    /// Check the job's options and name. Every problem goes into `errors`.
    fn check_job(&self, job: &Job, errors: &mut ErrorAccumulator) {
        for key in &self.required {
            if !job.options.contains_key(key) {
                errors.add_exception(Issue::new(
                    &job.name,
                    format!("missing required option '{}' for {}", key, self.program),
                ));
            }
        }

        for key in job.options.keys() {
            if !self.required.contains(key) && !self.optional.contains(key) {
                errors.add_warning(Issue::new(
                    &job.name,
                    format!("option '{}' is not used by {}", key, self.program),
                ));
            }
        }

        if job.name.is_empty()
            || job.name.contains(['/', '\\'])
            || job.name == "."
            || job.name == ".."
        {
            errors.add_exception(Issue::new(
                &job.name,
                "job name cannot be used as an output directory name",
            ));
        }
    }

    /// Dry run: option checks, command lookup, and a trial output
    /// directory inside `scratch`.
    async fn dry_run(&self, job: &Job, scratch: &Path, errors: &mut ErrorAccumulator) {
        self.check_job(job, errors);

        if self.cmd.trim().is_empty() {
            errors.add_exception(Issue::new(
                &job.name,
                format!("no command configured for {}", self.program),
            ));
        } else if resolve_command(&self.cmd).is_none() {
            errors.add_exception(Issue::new(
                &job.name,
                format!("command '{}' for {} not found", self.cmd, self.program),
            ));
        }

        if !errors.has_exceptions_for(&job.name) {
            let trial = scratch.join(format!("{}.partial", job.name));
            if let Err(e) = tokio::fs::create_dir_all(&trial).await {
                errors.add_exception(Issue::new(
                    &job.name,
                    format!("cannot create output directory: {}", e),
                ));
            }
        }
    }

    /// Replace `final_dir` with `partial`.
    async fn publish(&self, partial: &Path, final_dir: &Path) -> std::io::Result<()> {
        let _guard = self.publish_lock.lock().await;
        if tokio::fs::try_exists(final_dir).await? {
            tokio::fs::remove_dir_all(final_dir).await?;
        }
        tokio::fs::rename(partial, final_dir).await
    }

    async fn run(
        &self,
        job: &Job,
        workdir: &Path,
        token: &Token,
        cancel: &CancellationToken,
    ) -> std::result::Result<JobOutput, ExportError> {
        let partial = workdir.join(partial_dir_name(job, token));
        let final_dir = workdir.join(&job.name);

        if tokio::fs::try_exists(&partial).await? {
            tokio::fs::remove_dir_all(&partial).await?;
        }
        tokio::fs::create_dir_all(&partial).await?;

        info!(
            job = %job.name,
            program = %self.program,
            cmd = %self.cmd,
            output = %partial.display(),
            "starting simulation process"
        );

        let mut cmd = Command::new(&self.cmd);
        cmd.args(&self.args)
            .current_dir(&partial)
            .env(OUTPUT_ENV, &partial)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in job.options.iter() {
            cmd.env(option_env_name(key), value);
        }

        let mut child = match cmd.spawn() {
            Ok(child) => child,
            Err(source) => {
                remove_partial(&partial).await;
                return Err(ExportError::Spawn {
                    cmd: self.cmd.clone(),
                    source,
                });
            }
        };

        token.set_status(format!("Running {}", self.program));

        let stdout_monitor = child.stdout.take().map(|stdout| {
            spawn_stdout_monitor(
                job.name.clone(),
                stdout,
                self.progress_pattern.clone(),
                token.clone(),
            )
        });

        // Always consume stderr so buffers don't fill; log at debug.
        if let Some(stderr) = child.stderr.take() {
            let job_name = job.name.clone();
            tokio::spawn(async move {
                let reader = BufReader::new(stderr);
                let mut lines = reader.lines();

                while let Ok(Some(line)) = lines.next_line().await {
                    debug!(job = %job_name, "stderr: {}", line);
                }
            });
        }

        tokio::select! {
            status_res = child.wait() => {
                let status = match status_res {
                    Ok(status) => status,
                    Err(e) => {
                        remove_partial(&partial).await;
                        return Err(ExportError::Io(e));
                    }
                };

                // Let the last progress lines land before reporting.
                if let Some(monitor) = stdout_monitor {
                    let _ = monitor.await;
                }

                let code = status.code().unwrap_or(-1);
                info!(
                    job = %job.name,
                    exit_code = code,
                    success = status.success(),
                    "simulation process exited"
                );

                if !status.success() {
                    remove_partial(&partial).await;
                    return Err(ExportError::ProgramFailed { code });
                }

                if let Err(e) = self.publish(&partial, &final_dir).await {
                    remove_partial(&partial).await;
                    return Err(e.into());
                }

                Ok(JobOutput {
                    output_dir: Some(final_dir),
                    ..JobOutput::default()
                })
            }

            _ = cancel.cancelled() => {
                info!(
                    job = %job.name,
                    "cancellation requested; stopping simulation process"
                );
                if let Err(e) = child.kill().await {
                    warn!(
                        job = %job.name,
                        error = %e,
                        "failed to kill simulation process on cancellation"
                    );
                }
                remove_partial(&partial).await;
                Err(ExportError::Cancelled)
            }
        }
    }
}

impl Exporter for CommandExporter {
    fn program(&self) -> &str {
        &self.program
    }

    fn export<'a>(&'a self, request: ExportRequest<'a>) -> ExportFuture<'a> {
        Box::pin(async move {
            let ExportRequest {
                job,
                workdir,
                errors,
                dry_run,
                token,
                cancel,
            } = request;

            if dry_run {
                self.dry_run(job, workdir, errors).await;
                return Ok(JobOutput {
                    output_dir: None,
                    warnings: errors.warnings(),
                });
            }

            self.check_job(job, errors);
            if errors.has_exceptions_for(&job.name) {
                return Err(ExportError::InvalidJob {
                    job: job.name.clone(),
                    reason: errors.exception_messages().join("; "),
                });
            }

            let mut output = self.run(job, workdir, token, cancel).await?;
            output.warnings = errors.warnings();
            Ok(output)
        })
    }
}

fn partial_dir_name(job: &Job, token: &Token) -> String {
    format!("{}.{}.partial", job.name, token.id().as_u64())
}

/// `beam-energy` -> `SIMRUNNER_OPT_BEAM_ENERGY`.
pub fn option_env_name(key: &str) -> String {
    let key: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{OPTION_ENV_PREFIX}{key}")
}

/// Locate `cmd` the way the OS would: as a path if it has a separator,
/// otherwise on `PATH`.
pub fn resolve_command(cmd: &str) -> Option<PathBuf> {
    let path = Path::new(cmd);
    if path.components().count() > 1 {
        return path.is_file().then(|| path.to_path_buf());
    }

    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(cmd))
        .find(|candidate| {
            candidate.is_file()
                || (cfg!(windows) && candidate.with_extension("exe").is_file())
        })
}

async fn remove_partial(partial: &Path) {
    if let Err(e) = tokio::fs::remove_dir_all(partial).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!(
                path = %partial.display(),
                error = %e,
                "failed to remove partial output"
            );
        }
    }
}
