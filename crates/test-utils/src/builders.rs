#![allow(dead_code)]

use std::collections::BTreeMap;
use std::path::PathBuf;

use simrunner::config::{ConfigFile, JobConfig, ProgramConfig, RawConfigFile, RunnerSection};
use simrunner::job::Job;

/// Builder for `Job`.
pub struct JobBuilder {
    job: Job,
}

impl JobBuilder {
    pub fn new(name: &str, program: &str) -> Self {
        Self {
            job: Job::new(name, program),
        }
    }

    pub fn option(mut self, key: &str, value: &str) -> Self {
        self.job.options.insert(key.to_string(), value.to_string());
        self
    }

    pub fn build(self) -> Job {
        self.job
    }
}

/// `count` option-less jobs named `<prefix>-0`, `<prefix>-1`, ...
pub fn jobs(prefix: &str, program: &str, count: usize) -> Vec<Job> {
    (0..count)
        .map(|i| Job::new(format!("{prefix}-{i}"), program))
        .collect()
}

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                runner: RunnerSection::default(),
                program: BTreeMap::new(),
                job: BTreeMap::new(),
            },
        }
    }

    pub fn with_max_workers(mut self, n: usize) -> Self {
        self.config.runner.max_workers = Some(n);
        self
    }

    pub fn with_workdir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.runner.workdir = dir.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: &str) -> Self {
        self.config.runner.poll_interval = interval.to_string();
        self
    }

    pub fn with_job_timeout(mut self, timeout: &str) -> Self {
        self.config.runner.job_timeout = Some(timeout.to_string());
        self
    }

    pub fn with_program(mut self, name: &str, program: ProgramConfig) -> Self {
        self.config.program.insert(name.to_string(), program);
        self
    }

    pub fn with_job(mut self, name: &str, program: &str, options: &[(&str, &str)]) -> Self {
        let options = options
            .iter()
            .map(|(k, v)| (k.to_string(), toml::Value::String(v.to_string())))
            .collect();
        self.config.job.insert(
            name.to_string(),
            JobConfig {
                program: program.to_string(),
                options,
            },
        );
        self
    }

    pub fn build_raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `ProgramConfig`.
pub struct ProgramConfigBuilder {
    program: ProgramConfig,
}

impl ProgramConfigBuilder {
    pub fn new(cmd: &str) -> Self {
        Self {
            program: ProgramConfig {
                cmd: cmd.to_string(),
                ..ProgramConfig::default()
            },
        }
    }

    pub fn arg(mut self, arg: &str) -> Self {
        self.program.args.push(arg.to_string());
        self
    }

    pub fn required(mut self, key: &str) -> Self {
        self.program.required.push(key.to_string());
        self
    }

    pub fn optional(mut self, key: &str) -> Self {
        self.program.optional.push(key.to_string());
        self
    }

    pub fn progress_pattern(mut self, pattern: &str) -> Self {
        self.program.progress_pattern = Some(pattern.to_string());
        self
    }

    pub fn build(self) -> ProgramConfig {
        self.program
    }
}
