// src/cli.rs

//! CLI argument parsing using `clap`.

use clap::{Parser, ValueEnum};

/// Command-line arguments for `simrunner`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "simrunner",
    version,
    about = "Validate and run batches of simulation jobs with bounded parallelism.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the project file (TOML).
    ///
    /// Default: `Simrunner.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value = "Simrunner.toml")]
    pub config: String,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `SIMRUNNER_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL")]
    pub log_level: Option<LogLevel>,

    /// Jobs allowed to run at once. Overrides `[runner] max_workers`.
    #[arg(long, value_name = "N")]
    pub max_workers: Option<usize>,

    /// Validate every job through its exporter, print the problems, and
    /// exit without running anything.
    #[arg(long)]
    pub dry_run: bool,

    /// Only consider this job (repeatable).
    #[arg(long, value_name = "JOB")]
    pub only: Vec<String>,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
