// src/exporter/progress.rs

//! Progress reporting from a program's stdout.

use regex::Regex;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::ChildStdout;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use crate::token::Token;

/// Extract a progress fraction from one stdout line.
///
/// The first capture group is the value. If it is directly followed by `%`
/// it is a percentage; otherwise it is already a fraction. Out-of-range
/// values are left to [`Token::set_progress`] to clamp.
pub fn parse_progress(re: &Regex, line: &str) -> Option<f64> {
    let caps = re.captures(line)?;
    let value = caps.get(1)?;
    let number: f64 = value.as_str().trim().parse().ok()?;

    let is_percent = line[value.end()..].trim_start().starts_with('%');
    if is_percent {
        Some(number / 100.0)
    } else {
        Some(number)
    }
}

/// Consume a child's stdout, forwarding matching progress lines to `token`.
///
/// Stdout is always drained, even without a pattern, so the pipe never
/// fills up and blocks the program.
pub fn spawn_stdout_monitor(
    job: String,
    stdout: ChildStdout,
    pattern: Option<Regex>,
    token: Token,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let reader = BufReader::new(stdout);
        let mut lines = reader.lines();

        while let Ok(Some(line)) = lines.next_line().await {
            trace!(job = %job, "stdout: {}", line);

            if let Some(re) = &pattern {
                if let Some(p) = parse_progress(re, &line) {
                    let stored = token.set_progress(p);
                    trace!(job = %job, reported = p, stored, "progress update");
                }
            }
        }

        debug!(job = %job, "stdout monitor ended");
    })
}
