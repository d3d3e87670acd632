// src/token/mod.rs

//! Hierarchical progress / state tokens.
//!
//! - [`state`] holds the [`TokenState`] enum and its transition table.
//! - [`tree`] holds the token tree itself: every [`Token`] is a handle into a
//!   tree whose nodes are guarded by one mutex, so workers on different
//!   threads can update their own leaf while the caller reads the aggregate.
//!
//! The runner owns the root token; each submitted job gets one child with
//! category [`SIMULATION_CATEGORY`].

pub mod state;
pub mod tree;

pub use state::TokenState;
pub use tree::{Token, TokenId, TokenSnapshot};

/// Category of the child token created for every submitted job.
pub const SIMULATION_CATEGORY: &str = "simulation";

/// Category of the runner's root token.
pub const PROJECT_CATEGORY: &str = "project";
