// src/runner/handle.rs

//! Per-job result handle.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::watch;

use crate::errors::ExportError;
use crate::job::{JobId, JobOutput};
use crate::token::Token;

/// How a job ended.
///
/// Cancellation is reported on its own, separate from both success and
/// failure.
#[derive(Debug, Clone)]
pub enum JobOutcome {
    Success(JobOutput),
    Failed(Arc<ExportError>),
    Cancelled,
}

impl JobOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, JobOutcome::Success(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, JobOutcome::Failed(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, JobOutcome::Cancelled)
    }

    pub fn output(&self) -> Option<&JobOutput> {
        match self {
            JobOutcome::Success(output) => Some(output),
            _ => None,
        }
    }

    pub fn error(&self) -> Option<&ExportError> {
        match self {
            JobOutcome::Failed(err) => Some(err),
            _ => None,
        }
    }
}

impl fmt::Display for JobOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobOutcome::Success(_) => f.write_str("success"),
            JobOutcome::Failed(err) => write!(f, "failed: {err}"),
            JobOutcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

type DoneCallback = Box<dyn FnOnce(&JobOutcome) + Send + 'static>;

struct HandleInner {
    id: JobId,
    name: String,
    program: String,
    token: Token,
    outcome: watch::Sender<Option<JobOutcome>>,
    callbacks: Mutex<Vec<DoneCallback>>,
}

/// Observable handle for one submitted job.
///
/// Resolves exactly once, to a [`JobOutcome`]. Cloning is cheap.
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<HandleInner>,
}

impl fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("outcome", &self.outcome())
            .finish()
    }
}

impl JobHandle {
    pub(crate) fn new(id: JobId, name: String, program: String, token: Token) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            inner: Arc::new(HandleInner {
                id,
                name,
                program,
                token,
                outcome,
                callbacks: Mutex::new(Vec::new()),
            }),
        }
    }

    pub fn id(&self) -> JobId {
        self.inner.id
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn program(&self) -> &str {
        &self.inner.program
    }

    /// The job's own token (a child of the runner's root token).
    pub fn token(&self) -> &Token {
        &self.inner.token
    }

    pub fn is_done(&self) -> bool {
        self.inner.outcome.borrow().is_some()
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner
            .outcome
            .borrow()
            .as_ref()
            .is_some_and(JobOutcome::is_cancelled)
    }

    /// The outcome, if the job has ended.
    pub fn outcome(&self) -> Option<JobOutcome> {
        self.inner.outcome.borrow().clone()
    }

    /// Wait until the job ends.
    pub async fn wait(&self) -> JobOutcome {
        let mut rx = self.inner.outcome.subscribe();
        let result = rx.wait_for(Option::is_some).await;
        // The sender lives inside this handle, so the wait can only end
        // once an outcome has been stored.
        result
            .ok()
            .and_then(|outcome| outcome.clone())
            .unwrap_or(JobOutcome::Cancelled)
    }

    /// Run `f` once the job ends, on whichever thread completes it. If the
    /// job has already ended, `f` runs immediately on the calling thread.
    pub fn add_done_callback<F>(&self, f: F)
    where
        F: FnOnce(&JobOutcome) + Send + 'static,
    {
        let ready = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match self.outcome() {
                Some(outcome) => outcome,
                None => {
                    callbacks.push(Box::new(f));
                    return;
                }
            }
        };
        f(&ready);
    }

    /// Store the outcome and fire callbacks. Only the first call has any
    /// effect.
    pub(crate) fn complete(&self, outcome: JobOutcome) -> bool {
        let callbacks = {
            let mut callbacks = self
                .inner
                .callbacks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if self.is_done() {
                return false;
            }
            self.inner.outcome.send_replace(Some(outcome.clone()));
            std::mem::take(&mut *callbacks)
        };

        for callback in callbacks {
            callback(&outcome);
        }
        true
    }
}
