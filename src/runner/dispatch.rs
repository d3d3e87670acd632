// src/runner/dispatch.rs

//! Pure dispatch state machine.
//!
//! [`DispatchCore`] decides *which* job runs *when*. It owns the runner
//! lifecycle, the FIFO queue of submitted job ids and the set of running
//! ids, and answers every event with a list of [`CoreCommand`]s for the
//! async shell (`event_loop.rs`) to carry out.
//!
//! It has no channels, no Tokio types, and does not perform any IO, so the
//! concurrency bound and dispatch order can be tested directly.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::job::JobId;

/// Lifecycle of a runner.
///
/// `Created -> Started -> Stopping -> Stopped`. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerState {
    Created,
    Started,
    Stopping,
    Stopped,
}

impl fmt::Display for RunnerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunnerState::Created => "created",
            RunnerState::Started => "started",
            RunnerState::Stopping => "stopping",
            RunnerState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Command produced by the core, to be executed by the async shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreCommand {
    /// A worker slot is free: start this job.
    StartJob(JobId),
    /// Job never started; resolve it as cancelled without touching its
    /// exporter.
    CancelQueued(JobId),
    /// Job is running; ask its exporter to stop.
    SignalCancel(JobId),
    /// Shutdown finished: nothing is queued or running any more.
    Stopped,
}

#[derive(Debug)]
pub struct DispatchCore {
    max_workers: usize,
    state: RunnerState,
    queue: VecDeque<JobId>,
    running: BTreeSet<JobId>,
}

impl DispatchCore {
    /// `max_workers` is clamped to at least 1.
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
            state: RunnerState::Created,
            queue: VecDeque::new(),
            running: BTreeSet::new(),
        }
    }

    pub fn state(&self) -> RunnerState {
        self.state
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn running_count(&self) -> usize {
        self.running.len()
    }

    pub fn queued_count(&self) -> usize {
        self.queue.len()
    }

    pub fn is_idle(&self) -> bool {
        self.running.is_empty() && self.queue.is_empty()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains(&id)
    }

    pub fn is_queued(&self, id: JobId) -> bool {
        self.queue.contains(&id)
    }

    /// Only a started runner accepts submissions.
    pub fn is_accepting(&self) -> bool {
        self.state == RunnerState::Started
    }

    /// `Created -> Started`. Returns `false` (and changes nothing) in any
    /// other state.
    pub fn start(&mut self) -> bool {
        if self.state == RunnerState::Created {
            self.state = RunnerState::Started;
            true
        } else {
            false
        }
    }

    /// Append jobs to the queue in the given order and start as many as
    /// there are free slots.
    pub fn enqueue<I>(&mut self, ids: I) -> Vec<CoreCommand>
    where
        I: IntoIterator<Item = JobId>,
    {
        if !self.is_accepting() {
            debug!(state = %self.state, "enqueue while not accepting; ignoring");
            return Vec::new();
        }
        self.queue.extend(ids);
        self.fill_slots()
    }

    /// A running job reached a terminal state.
    pub fn finished(&mut self, id: JobId) -> Vec<CoreCommand> {
        if !self.running.remove(&id) {
            debug!(job_id = %id, "finish for a job that is not running; ignoring");
        }

        let mut commands = self.fill_slots();
        if self.state == RunnerState::Stopping && self.is_idle() {
            self.state = RunnerState::Stopped;
            commands.push(CoreCommand::Stopped);
        }
        commands
    }

    /// Cancel every queued and running job.
    pub fn cancel_all(&mut self) -> Vec<CoreCommand> {
        let mut commands: Vec<CoreCommand> =
            self.queue.drain(..).map(CoreCommand::CancelQueued).collect();
        commands.extend(self.running.iter().copied().map(CoreCommand::SignalCancel));
        commands
    }

    /// Cancel a single job, wherever it is.
    pub fn cancel_one(&mut self, id: JobId) -> Vec<CoreCommand> {
        if let Some(pos) = self.queue.iter().position(|queued| *queued == id) {
            self.queue.remove(pos);
            return vec![CoreCommand::CancelQueued(id)];
        }
        if self.running.contains(&id) {
            return vec![CoreCommand::SignalCancel(id)];
        }
        Vec::new()
    }

    /// Stop accepting work and cancel everything outstanding.
    ///
    /// Emits [`CoreCommand::Stopped`] right away when nothing is running;
    /// otherwise it follows the last [`finished`](Self::finished).
    pub fn begin_shutdown(&mut self) -> Vec<CoreCommand> {
        match self.state {
            RunnerState::Stopped => return Vec::new(),
            RunnerState::Stopping => return Vec::new(),
            RunnerState::Created | RunnerState::Started => {}
        }

        self.state = RunnerState::Stopping;
        let mut commands = self.cancel_all();
        if self.is_idle() {
            self.state = RunnerState::Stopped;
            commands.push(CoreCommand::Stopped);
        }
        commands
    }

    fn fill_slots(&mut self) -> Vec<CoreCommand> {
        let mut commands = Vec::new();
        if self.state != RunnerState::Started {
            return commands;
        }

        while self.running.len() < self.max_workers {
            let Some(id) = self.queue.pop_front() else {
                break;
            };
            self.running.insert(id);
            commands.push(CoreCommand::StartJob(id));
        }
        commands
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(range: std::ops::Range<u64>) -> Vec<JobId> {
        range.map(JobId).collect()
    }

    fn started(commands: &[CoreCommand]) -> Vec<JobId> {
        commands
            .iter()
            .filter_map(|c| match c {
                CoreCommand::StartJob(id) => Some(*id),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn enqueue_respects_max_workers_and_order() {
        let mut core = DispatchCore::new(2);
        assert!(core.start());

        let commands = core.enqueue(ids(0..5));
        assert_eq!(started(&commands), vec![JobId(0), JobId(1)]);
        assert_eq!(core.running_count(), 2);
        assert_eq!(core.queued_count(), 3);

        let commands = core.finished(JobId(1));
        assert_eq!(started(&commands), vec![JobId(2)]);
        assert_eq!(core.running_count(), 2);
    }

    #[test]
    fn enqueue_before_start_is_ignored() {
        let mut core = DispatchCore::new(1);
        assert!(core.enqueue(ids(0..2)).is_empty());
        assert!(core.is_idle());
    }

    #[test]
    fn start_is_idempotent() {
        let mut core = DispatchCore::new(1);
        assert!(core.start());
        assert!(!core.start());
        assert_eq!(core.state(), RunnerState::Started);
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        let core = DispatchCore::new(0);
        assert_eq!(core.max_workers(), 1);
    }

    #[test]
    fn cancel_all_splits_queued_and_running() {
        let mut core = DispatchCore::new(1);
        core.start();
        core.enqueue(ids(0..3));

        let commands = core.cancel_all();
        assert_eq!(
            commands,
            vec![
                CoreCommand::CancelQueued(JobId(1)),
                CoreCommand::CancelQueued(JobId(2)),
                CoreCommand::SignalCancel(JobId(0)),
            ]
        );
        assert_eq!(core.queued_count(), 0);
        // Running job keeps its slot until it acknowledges.
        assert!(core.is_running(JobId(0)));

        // A second cancel only re-signals the running job.
        assert_eq!(core.cancel_all(), vec![CoreCommand::SignalCancel(JobId(0))]);
    }

    #[test]
    fn cancel_one_targets_a_single_job() {
        let mut core = DispatchCore::new(1);
        core.start();
        core.enqueue(ids(0..3));

        assert_eq!(core.cancel_one(JobId(2)), vec![CoreCommand::CancelQueued(JobId(2))]);
        assert_eq!(core.cancel_one(JobId(0)), vec![CoreCommand::SignalCancel(JobId(0))]);
        assert!(core.cancel_one(JobId(42)).is_empty());

        let commands = core.finished(JobId(0));
        assert_eq!(started(&commands), vec![JobId(1)]);
    }

    #[test]
    fn shutdown_when_idle_stops_immediately() {
        let mut core = DispatchCore::new(1);
        core.start();
        assert_eq!(core.begin_shutdown(), vec![CoreCommand::Stopped]);
        assert_eq!(core.state(), RunnerState::Stopped);
        assert!(core.begin_shutdown().is_empty());
    }

    #[test]
    fn shutdown_waits_for_running_jobs() {
        let mut core = DispatchCore::new(2);
        core.start();
        core.enqueue(ids(0..3));

        let commands = core.begin_shutdown();
        assert_eq!(
            commands,
            vec![
                CoreCommand::CancelQueued(JobId(2)),
                CoreCommand::SignalCancel(JobId(0)),
                CoreCommand::SignalCancel(JobId(1)),
            ]
        );
        assert_eq!(core.state(), RunnerState::Stopping);
        assert!(!core.is_accepting());
        assert!(core.enqueue(ids(10..11)).is_empty());

        assert!(core.finished(JobId(0)).is_empty());
        assert_eq!(core.finished(JobId(1)), vec![CoreCommand::Stopped]);
        assert_eq!(core.state(), RunnerState::Stopped);
    }
}
