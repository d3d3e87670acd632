// src/config/validate.rs

use regex::Regex;

use crate::config::duration::parse_duration;
use crate::config::model::{ConfigFile, RawConfigFile, RunnerSettings};
use crate::errors::{Result, SimRunnerError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = crate::errors::SimRunnerError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        let runner = runner_settings(&raw)?;
        Ok(ConfigFile::new_unchecked(runner, raw.program, raw.job))
    }
}

fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    ensure_has_jobs(cfg)?;
    validate_programs(cfg)?;
    validate_jobs(cfg)?;
    Ok(())
}

fn ensure_has_jobs(cfg: &RawConfigFile) -> Result<()> {
    if cfg.job.is_empty() {
        return Err(SimRunnerError::ConfigError(
            "config must contain at least one [job.<name>] section".to_string(),
        ));
    }
    Ok(())
}

fn validate_programs(cfg: &RawConfigFile) -> Result<()> {
    for (name, program) in cfg.program.iter() {
        if program.cmd.trim().is_empty() {
            return Err(SimRunnerError::ConfigError(format!(
                "program '{}' has an empty `cmd`",
                name
            )));
        }
        if let Some(pattern) = &program.progress_pattern {
            let re = Regex::new(pattern).map_err(|e| {
                SimRunnerError::ConfigError(format!(
                    "program '{}' has an invalid progress_pattern: {}",
                    name, e
                ))
            })?;
            if re.captures_len() < 2 {
                return Err(SimRunnerError::ConfigError(format!(
                    "program '{}': progress_pattern needs one capture group for the value",
                    name
                )));
            }
        }
    }
    Ok(())
}

fn validate_jobs(cfg: &RawConfigFile) -> Result<()> {
    for (name, job) in cfg.job.iter() {
        if job.program.trim().is_empty() {
            return Err(SimRunnerError::ConfigError(format!(
                "job '{}' has an empty `program`",
                name
            )));
        }
        // Unknown programs are left to the dry-run pass so they show up
        // alongside every other validation problem.
    }
    Ok(())
}

fn runner_settings(cfg: &RawConfigFile) -> Result<RunnerSettings> {
    let section = &cfg.runner;

    if section.max_workers == Some(0) {
        return Err(SimRunnerError::ConfigError(
            "[runner].max_workers must be >= 1 (got 0)".to_string(),
        ));
    }

    let poll_interval = parse_duration(&section.poll_interval).map_err(|e| {
        SimRunnerError::ConfigError(format!("[runner].poll_interval: {}", e))
    })?;
    if poll_interval.is_zero() {
        return Err(SimRunnerError::ConfigError(
            "[runner].poll_interval must be greater than zero".to_string(),
        ));
    }

    let job_timeout = section
        .job_timeout
        .as_deref()
        .map(parse_duration)
        .transpose()
        .map_err(|e| SimRunnerError::ConfigError(format!("[runner].job_timeout: {}", e)))?;

    Ok(RunnerSettings {
        max_workers: section.max_workers,
        workdir: section.workdir.clone(),
        poll_interval,
        job_timeout,
    })
}
