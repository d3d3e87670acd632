#![allow(dead_code, unused_imports)]

pub use simrunner_test_utils::builders;
pub use simrunner_test_utils::fake_exporter;
pub use simrunner_test_utils::{init_tracing, start_runner, with_timeout};

use simrunner::job::Job;
use simrunner::runner::JobHandle;
use simrunner::token::TokenState;

/// Names of `handles`, in order.
pub fn names(handles: &[JobHandle]) -> Vec<String> {
    handles.iter().map(|h| h.name().to_string()).collect()
}

/// Leaf states of every job token, in submission order.
pub fn token_states(handles: &[JobHandle]) -> Vec<TokenState> {
    handles.iter().map(|h| h.token().state()).collect()
}

pub fn job(name: &str, program: &str) -> Job {
    Job::new(name, program)
}
