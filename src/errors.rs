// src/errors.rs

//! Crate-wide error types and aliases.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SimRunnerError {
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TOML parsing error: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("runner has not been started")]
    NotStarted,

    #[error("runner is stopped; a new runner is required")]
    Stopped,

    #[error("no async execution context available to start the runner")]
    NoExecutionContext,

    #[error("max_workers must be >= 1 (got {0})")]
    InvalidMaxWorkers(usize),

    #[error("bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure of a single job inside an exporter.
///
/// These never escape the runner: they end up in the job's
/// [`JobOutcome`](crate::runner::JobOutcome).
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("job was cancelled")]
    Cancelled,

    #[error("invalid job '{job}': {reason}")]
    InvalidJob { job: String, reason: String },

    #[error("no exporter registered for program '{0}'")]
    UnknownProgram(String),

    #[error("program exited with status {code}")]
    ProgramFailed { code: i32 },

    #[error("failed to spawn '{cmd}': {source}")]
    Spawn {
        cmd: String,
        #[source]
        source: std::io::Error,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("job panicked: {0}")]
    Panicked(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Failure while marshalling a call onto the execution context.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("failed to build execution context: {0}")]
    Build(#[source] std::io::Error),

    #[error("blocking call issued from inside the execution context")]
    NestedCall,

    #[error("task on the execution context was aborted before replying")]
    TaskAborted,
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, SimRunnerError>;
