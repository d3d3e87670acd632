// src/job.rs

//! The unit of work submitted to the runner.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use crate::accumulator::Issue;

/// Canonical job name type.
pub type JobName = String;

/// One simulation configuration awaiting execution.
///
/// The runner never looks inside `options`; only the exporter for `program`
/// interprets them. Jobs are immutable once submitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Job {
    pub name: JobName,
    pub program: String,
    pub options: BTreeMap<String, String>,
}

impl Job {
    pub fn new(name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            options: BTreeMap::new(),
        }
    }

    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// The same option set, aimed at another program.
    pub fn for_program(&self, program: &str) -> Job {
        Job {
            name: self.name.clone(),
            program: program.to_string(),
            options: self.options.clone(),
        }
    }
}

/// Identifier assigned by the runner at submission time.
///
/// Ids increase monotonically in submission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub(crate) u64);

impl JobId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "job-{}", self.0)
    }
}

/// What a successful export produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobOutput {
    /// Final output location, if the exporter writes one.
    pub output_dir: Option<PathBuf>,
    /// Non-fatal problems reported while running.
    pub warnings: BTreeSet<Issue>,
}
