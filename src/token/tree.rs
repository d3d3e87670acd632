// src/token/tree.rs

//! Token tree guarded by a single mutex.
//!
//! All nodes of one tree live in a map behind one `std::sync::Mutex`. The
//! tree is small and every mutation is brief, so a coarse lock is enough and
//! keeps composite reads (`progress`, `state`) consistent with concurrent
//! leaf updates.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;
use tokio::sync::watch;
use tracing::trace;

use super::state::TokenState;

/// Opaque identifier of a token, unique within its tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TokenId(u64);

impl TokenId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug)]
struct Node {
    category: Option<String>,
    status: Option<String>,
    state: TokenState,
    progress: f64,
    children: Vec<TokenId>,
}

impl Node {
    fn new(category: Option<String>) -> Self {
        Self {
            category,
            status: None,
            state: TokenState::NotStarted,
            progress: 0.0,
            children: Vec::new(),
        }
    }
}

#[derive(Debug, Default)]
struct TreeInner {
    nodes: HashMap<TokenId, Node>,
    next_id: u64,
}

impl TreeInner {
    fn insert(&mut self, category: Option<String>) -> TokenId {
        let id = TokenId(self.next_id);
        self.next_id += 1;
        self.nodes.insert(id, Node::new(category));
        id
    }

    fn progress_of(&self, id: TokenId) -> f64 {
        let Some(node) = self.nodes.get(&id) else {
            return 0.0;
        };
        if node.children.is_empty() {
            return node.progress;
        }
        let sum: f64 = node.children.iter().map(|c| self.progress_of(*c)).sum();
        sum / node.children.len() as f64
    }

    fn state_of(&self, id: TokenId) -> TokenState {
        let Some(node) = self.nodes.get(&id) else {
            return TokenState::NotStarted;
        };
        if node.children.is_empty() {
            return node.state;
        }
        TokenState::aggregate(node.children.iter().map(|c| self.state_of(*c)))
    }

    fn remove_subtree(&mut self, id: TokenId) {
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                self.remove_subtree(child);
            }
        }
    }

    fn snapshot_of(&self, id: TokenId) -> TokenSnapshot {
        let node = self.nodes.get(&id);
        TokenSnapshot {
            id,
            category: node.and_then(|n| n.category.clone()),
            status: node.and_then(|n| n.status.clone()),
            state: self.state_of(id),
            progress: self.progress_of(id),
            subtokens: node
                .map(|n| n.children.iter().map(|c| self.snapshot_of(*c)).collect())
                .unwrap_or_default(),
        }
    }
}

#[derive(Debug)]
struct TreeShared {
    inner: Mutex<TreeInner>,
    revision: watch::Sender<u64>,
}

impl TreeShared {
    fn lock(&self) -> MutexGuard<'_, TreeInner> {
        // A panicking worker must not take the whole tree down with it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.revision.send_modify(|rev| *rev += 1);
    }
}

/// Handle to one node of a token tree.
///
/// Cloning is cheap; all clones refer to the same node. A token whose node
/// was dropped by a [`reset`](Token::reset) of an ancestor behaves as an
/// inert, not-started token: mutations are ignored.
#[derive(Clone)]
pub struct Token {
    shared: Arc<TreeShared>,
    id: TokenId,
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Token")
            .field("id", &self.id)
            .field("category", &self.category())
            .field("state", &self.state())
            .field("progress", &self.progress())
            .finish()
    }
}

impl Token {
    /// Create the root of a new token tree.
    pub fn new(category: Option<&str>) -> Self {
        let mut inner = TreeInner::default();
        let id = inner.insert(category.map(str::to_string));
        let (revision, _) = watch::channel(0);
        Self {
            shared: Arc::new(TreeShared {
                inner: Mutex::new(inner),
                revision,
            }),
            id,
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn category(&self) -> Option<String> {
        self.shared
            .lock()
            .nodes
            .get(&self.id)
            .and_then(|n| n.category.clone())
    }

    pub fn status(&self) -> Option<String> {
        self.shared
            .lock()
            .nodes
            .get(&self.id)
            .and_then(|n| n.status.clone())
    }

    /// Current progress in `[0.0, 1.0]`.
    ///
    /// For a composite token this is the equal-weighted mean of its
    /// children's progress.
    pub fn progress(&self) -> f64 {
        self.shared.lock().progress_of(self.id)
    }

    /// Current state; derived from the children for a composite token.
    pub fn state(&self) -> TokenState {
        self.shared.lock().state_of(self.id)
    }

    pub fn is_leaf(&self) -> bool {
        self.shared
            .lock()
            .nodes
            .get(&self.id)
            .is_none_or(|n| n.children.is_empty())
    }

    /// Append a new child token and return it.
    pub fn add_subtoken(&self, category: Option<&str>) -> Token {
        let id = {
            let mut inner = self.shared.lock();
            if !inner.nodes.contains_key(&self.id) {
                // Parent was reset away; hand back a detached node so callers
                // still get a usable token.
                inner.insert(category.map(str::to_string))
            } else {
                let child = inner.insert(category.map(str::to_string));
                if let Some(parent) = inner.nodes.get_mut(&self.id) {
                    parent.children.push(child);
                }
                child
            }
        };
        self.shared.bump();
        trace!(parent = %self.id, child = %id, ?category, "added subtoken");

        Token {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Raise the stored progress to `min(p, 1.0)`.
    ///
    /// Lower values and NaN are ignored so concurrent reporters can never
    /// move a progress bar backwards. Returns the stored value afterwards.
    pub fn set_progress(&self, p: f64) -> f64 {
        let (stored, changed) = {
            let mut inner = self.shared.lock();
            match inner.nodes.get_mut(&self.id) {
                Some(node) => {
                    let candidate = p.min(1.0);
                    if !p.is_nan() && candidate > node.progress {
                        node.progress = candidate;
                        (node.progress, true)
                    } else {
                        (node.progress, false)
                    }
                }
                None => (0.0, false),
            }
        };
        if changed {
            self.shared.bump();
        }
        stored
    }

    /// Apply a state transition. Illegal transitions are ignored and return
    /// `false`.
    pub fn set_state(&self, next: TokenState) -> bool {
        let applied = {
            let mut inner = self.shared.lock();
            match inner.nodes.get_mut(&self.id) {
                Some(node) if node.state.can_transition_to(next) => {
                    node.state = next;
                    true
                }
                Some(node) => {
                    trace!(
                        token = %self.id,
                        from = %node.state,
                        to = %next,
                        "ignoring illegal token transition"
                    );
                    false
                }
                None => false,
            }
        };
        if applied {
            self.shared.bump();
        }
        applied
    }

    pub fn set_status(&self, status: impl Into<String>) {
        let status = status.into();
        {
            let mut inner = self.shared.lock();
            if let Some(node) = inner.nodes.get_mut(&self.id) {
                node.status = Some(status);
            }
        }
        self.shared.bump();
    }

    /// Snapshot of the direct children in insertion order, optionally
    /// filtered by category. Never mutates the tree.
    pub fn get_subtokens(&self, category: Option<&str>) -> Vec<Token> {
        let inner = self.shared.lock();
        let Some(node) = inner.nodes.get(&self.id) else {
            return Vec::new();
        };

        node.children
            .iter()
            .filter(|child| match category {
                None => true,
                Some(wanted) => inner
                    .nodes
                    .get(child)
                    .is_some_and(|n| n.category.as_deref() == Some(wanted)),
            })
            .map(|child| Token {
                shared: Arc::clone(&self.shared),
                id: *child,
            })
            .collect()
    }

    /// Count direct children of `category` whose state matches `pred`.
    pub fn count_subtokens<F>(&self, category: Option<&str>, pred: F) -> usize
    where
        F: Fn(TokenState) -> bool,
    {
        let inner = self.shared.lock();
        let Some(node) = inner.nodes.get(&self.id) else {
            return 0;
        };

        node.children
            .iter()
            .filter(|child| {
                let matches_category = match category {
                    None => true,
                    Some(wanted) => inner
                        .nodes
                        .get(child)
                        .is_some_and(|n| n.category.as_deref() == Some(wanted)),
                };
                matches_category && pred(inner.state_of(**child))
            })
            .count()
    }

    /// Deep copy of this token and its descendants, taken under one lock.
    pub fn snapshot(&self) -> TokenSnapshot {
        self.shared.lock().snapshot_of(self.id)
    }

    /// Drop all children and return to `NotStarted` with zero progress.
    ///
    /// This is the only way to leave a terminal state.
    pub fn reset(&self) {
        {
            let mut inner = self.shared.lock();
            let children = match inner.nodes.get_mut(&self.id) {
                Some(node) => {
                    node.state = TokenState::NotStarted;
                    node.progress = 0.0;
                    node.status = None;
                    std::mem::take(&mut node.children)
                }
                None => return,
            };
            for child in children {
                inner.remove_subtree(child);
            }
        }
        self.shared.bump();
    }

    /// Subscribe to tree changes.
    ///
    /// The value is a revision counter bumped on every mutation anywhere in
    /// the tree; pair it with [`snapshot`](Token::snapshot) for a push-style
    /// view instead of polling.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.shared.revision.subscribe()
    }
}

/// Point-in-time copy of a token subtree, for display.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TokenSnapshot {
    pub id: TokenId,
    pub category: Option<String>,
    pub status: Option<String>,
    pub state: TokenState,
    pub progress: f64,
    pub subtokens: Vec<TokenSnapshot>,
}
