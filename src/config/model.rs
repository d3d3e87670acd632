// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::job::Job;
use crate::runner::RunnerOptions;

/// Configuration exactly as read from a TOML file.
///
/// ```toml
/// [runner]
/// max_workers = 2
/// workdir = "runs"
/// poll_interval = "1s"
///
/// [program.casino2]
/// cmd = "casino2-batch"
/// required = ["beam_energy", "material"]
/// progress_pattern = '^progress:\s*([0-9.]+)'
///
/// [job.cu_15kv]
/// program = "casino2"
/// options = { beam_energy = "15e3", material = "Cu" }
/// ```
///
/// All sections are optional at this level; [`ConfigFile`] is the
/// validated form the rest of the crate uses.
#[derive(Debug, Clone, Deserialize)]
pub struct RawConfigFile {
    #[serde(default)]
    pub runner: RunnerSection,

    /// All programs from `[program.<name>]`.
    #[serde(default)]
    pub program: BTreeMap<String, ProgramConfig>,

    /// All jobs from `[job.<name>]`.
    #[serde(default)]
    pub job: BTreeMap<String, JobConfig>,
}

/// `[runner]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct RunnerSection {
    /// Number of jobs allowed to run at once.
    ///
    /// If `None`, the runner uses `cpu_count - 1` (at least 1).
    #[serde(default)]
    pub max_workers: Option<usize>,

    /// Directory jobs write their output into.
    #[serde(default = "default_workdir")]
    pub workdir: PathBuf,

    /// How often the status line is refreshed, e.g. `"1s"`.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Optional per-job time limit, e.g. `"30m"`. Jobs running longer are
    /// cancelled.
    #[serde(default)]
    pub job_timeout: Option<String>,
}

fn default_workdir() -> PathBuf {
    PathBuf::from("simrunner-output")
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            max_workers: None,
            workdir: default_workdir(),
            poll_interval: default_poll_interval(),
            job_timeout: None,
        }
    }
}

/// `[program.<name>]` section: how to launch one simulation program.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct ProgramConfig {
    /// Executable to run.
    pub cmd: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Options every job for this program must set.
    #[serde(default)]
    pub required: Vec<String>,

    /// Options the program understands but does not require. Anything that
    /// is neither required nor optional is reported as a warning.
    #[serde(default)]
    pub optional: Vec<String>,

    /// Regex with one capture group matching a progress value on stdout,
    /// e.g. `'^progress:\s*([0-9.]+)'`. A value followed by `%` is read as
    /// a percentage.
    #[serde(default)]
    pub progress_pattern: Option<String>,
}

/// `[job.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct JobConfig {
    pub program: String,

    /// Program options. Non-string TOML values are kept in their TOML
    /// spelling.
    #[serde(default)]
    pub options: BTreeMap<String, toml::Value>,
}

impl JobConfig {
    pub fn to_job(&self, name: &str) -> Job {
        let mut job = Job::new(name, &self.program);
        for (key, value) in self.options.iter() {
            let value = match value {
                toml::Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            job = job.with_option(key, value);
        }
        job
    }
}

/// `[runner]` after validation, with durations parsed.
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub max_workers: Option<usize>,
    pub workdir: PathBuf,
    pub poll_interval: Duration,
    pub job_timeout: Option<Duration>,
}

/// Validated configuration.
///
/// Only obtainable through `ConfigFile::try_from(RawConfigFile)` (see
/// `validate.rs`) or [`crate::config::load_and_validate`].
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub runner: RunnerSettings,
    pub program: BTreeMap<String, ProgramConfig>,
    pub job: BTreeMap<String, JobConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(
        runner: RunnerSettings,
        program: BTreeMap<String, ProgramConfig>,
        job: BTreeMap<String, JobConfig>,
    ) -> Self {
        Self {
            runner,
            program,
            job,
        }
    }

    /// All jobs, ordered by name.
    pub fn jobs(&self) -> Vec<Job> {
        self.job
            .iter()
            .map(|(name, cfg)| cfg.to_job(name))
            .collect()
    }

    pub fn runner_options(&self) -> RunnerOptions {
        RunnerOptions {
            max_workers: self.runner.max_workers,
            workdir: self.runner.workdir.clone(),
            job_timeout: self.runner.job_timeout,
        }
    }
}
