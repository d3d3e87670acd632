// src/token/state.rs

use std::fmt;

use serde::Serialize;

/// Lifecycle state of a token.
///
/// Leaf tokens follow the table in [`TokenState::can_transition_to`];
/// composite tokens derive their state from their children.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenState {
    #[default]
    NotStarted,
    Running,
    Cancelled,
    Done,
}

impl TokenState {
    /// `Cancelled` and `Done` are terminal. Leaving them requires a reset.
    pub fn is_terminal(self) -> bool {
        matches!(self, TokenState::Cancelled | TokenState::Done)
    }

    /// Whether `self -> next` is a legal leaf transition.
    ///
    /// Legal: `NotStarted -> Running`, `NotStarted -> Cancelled`,
    /// `Running -> Done`, `Running -> Cancelled`.
    pub fn can_transition_to(self, next: TokenState) -> bool {
        matches!(
            (self, next),
            (TokenState::NotStarted, TokenState::Running)
                | (TokenState::NotStarted, TokenState::Cancelled)
                | (TokenState::Running, TokenState::Done)
                | (TokenState::Running, TokenState::Cancelled)
        )
    }

    /// Derive the state of a composite token from its children.
    ///
    /// - any child running: `Running`
    /// - every child not started (or no children): `NotStarted`
    /// - every child terminal: `Cancelled` if any child was cancelled,
    ///   otherwise `Done`
    /// - a mix of finished and not-yet-started children: `Running`
    pub fn aggregate<I>(children: I) -> TokenState
    where
        I: IntoIterator<Item = TokenState>,
    {
        let mut any_running = false;
        let mut any_not_started = false;
        let mut any_cancelled = false;
        let mut any_terminal = false;

        for state in children {
            match state {
                TokenState::Running => any_running = true,
                TokenState::NotStarted => any_not_started = true,
                TokenState::Cancelled => {
                    any_cancelled = true;
                    any_terminal = true;
                }
                TokenState::Done => any_terminal = true,
            }
        }

        if any_running {
            TokenState::Running
        } else if !any_terminal {
            TokenState::NotStarted
        } else if any_not_started {
            TokenState::Running
        } else if any_cancelled {
            TokenState::Cancelled
        } else {
            TokenState::Done
        }
    }
}

impl fmt::Display for TokenState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenState::NotStarted => "not started",
            TokenState::Running => "running",
            TokenState::Cancelled => "cancelled",
            TokenState::Done => "done",
        };
        f.write_str(s)
    }
}
