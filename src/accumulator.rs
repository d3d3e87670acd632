// src/accumulator.rs

//! Collector for non-fatal problems found during a validation or run pass.
//!
//! Exporters report every problem they find here instead of failing on the
//! first one, so a single dry run returns the complete list.

use std::collections::BTreeSet;
use std::fmt;

/// One reported problem: what it is about, and what is wrong with it.
///
/// Two issues with the same subject and message are the same issue.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Issue {
    pub subject: String,
    pub message: String,
}

impl Issue {
    pub fn new(subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.subject, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ErrorAccumulator {
    exceptions: BTreeSet<Issue>,
    warnings: BTreeSet<Issue>,
}

impl ErrorAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an error. Returns `false` if an equal error was already there.
    pub fn add_exception(&mut self, issue: Issue) -> bool {
        self.exceptions.insert(issue)
    }

    /// Record a warning. Returns `false` if an equal warning was already there.
    pub fn add_warning(&mut self, issue: Issue) -> bool {
        self.warnings.insert(issue)
    }

    pub fn exceptions(&self) -> BTreeSet<Issue> {
        self.exceptions.clone()
    }

    pub fn warnings(&self) -> BTreeSet<Issue> {
        self.warnings.clone()
    }

    pub fn has_exceptions(&self) -> bool {
        !self.exceptions.is_empty()
    }

    pub fn is_empty(&self) -> bool {
        self.exceptions.is_empty() && self.warnings.is_empty()
    }

    /// Whether any error mentions `subject`.
    pub fn has_exceptions_for(&self, subject: &str) -> bool {
        self.exceptions.iter().any(|i| i.subject == subject)
    }

    /// Merge another pass into this one.
    pub fn extend(&mut self, other: ErrorAccumulator) {
        self.exceptions.extend(other.exceptions);
        self.warnings.extend(other.warnings);
    }

    /// Sorted, de-duplicated error lines ready for display.
    pub fn exception_messages(&self) -> Vec<String> {
        self.exceptions.iter().map(ToString::to_string).collect()
    }

    pub fn warning_messages(&self) -> Vec<String> {
        self.warnings.iter().map(ToString::to_string).collect()
    }
}
