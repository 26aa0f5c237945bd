//! The unit of dependency tracking. A node has a key, a set of input nodes,
//! a stable hash of its identity, and a small lifecycle state machine.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::ast::Args;
use crate::doc::Chain;
use crate::error::NodeError;
use crate::hash::{Hash32, hashid};

/// Node lifecycle. `Consolidated` is the cache-hit terminal: the node's
/// output was reused unchanged and no filter logic ran this time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum State {
    New,
    Populated,
    Ran,
    Consolidated,
    Complete,
    Error,
}

impl State {
    fn can_transition(self, to: State) -> bool {
        // Error is reachable from anywhere.
        if to == State::Error {
            return true;
        }

        matches!(
            (self, to),
            (State::New, State::Populated)
                | (State::Populated, State::Ran)
                | (State::Populated, State::Consolidated)
                | (State::Ran, State::Complete)
                | (State::Consolidated, State::Complete)
        )
    }

    /// A node may execute only once all of its inputs are terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Ran | State::Consolidated | State::Complete)
    }
}

#[derive(Debug)]
pub enum NodeKind {
    /// One real or virtual file plus zero or more chained filters.
    Doc(Chain),
    /// A named group of other nodes with no content of its own.
    Bundle,
}

#[derive(Debug)]
pub struct Node {
    pub key: String,
    pub kind: NodeKind,
    pub args: Args,
    /// Fingerprint of `(key, args)`, reproducible across runs with unchanged
    /// config regardless of argument insertion order.
    pub hashid: Hash32,
    pub state: State,
    /// Content hash of the node's final output, set when the node finishes.
    pub output: Option<Hash32>,
    pub elapsed: Option<Duration>,
}

impl Node {
    pub fn new(key: impl Into<String>, kind: NodeKind, args: Args) -> Self {
        let key = key.into();
        let hashid = hashid(&key, &args);

        Self {
            key,
            kind,
            args,
            hashid,
            state: State::New,
            output: None,
            elapsed: None,
        }
    }

    pub fn transition(&mut self, to: State) -> Result<(), NodeError> {
        if !self.state.can_transition(to) {
            return Err(NodeError::InvalidTransition {
                key: self.key.clone(),
                from: self.state,
                to,
            });
        }

        self.state = to;
        Ok(())
    }

    pub fn is_doc(&self) -> bool {
        matches!(self.kind, NodeKind::Doc(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle(key: &str) -> Node {
        Node::new(key, NodeKind::Bundle, Args::new())
    }

    #[test]
    fn lifecycle_happy_path() {
        let mut node = bundle("docs");
        node.transition(State::Populated).unwrap();
        node.transition(State::Ran).unwrap();
        node.transition(State::Complete).unwrap();
        assert_eq!(node.state, State::Complete);
    }

    #[test]
    fn cache_hit_path() {
        let mut node = bundle("docs");
        node.transition(State::Populated).unwrap();
        node.transition(State::Consolidated).unwrap();
        node.transition(State::Complete).unwrap();
    }

    #[test]
    fn invalid_transition_is_a_defect() {
        let mut node = bundle("docs");
        let err = node.transition(State::Complete).unwrap_err();
        assert!(matches!(
            err,
            NodeError::InvalidTransition {
                from: State::New,
                to: State::Complete,
                ..
            }
        ));
        // State is left untouched on a rejected transition.
        assert_eq!(node.state, State::New);
    }

    #[test]
    fn error_reachable_from_any_state() {
        for prepare in [0, 1, 2] {
            let mut node = bundle("docs");
            if prepare > 0 {
                node.transition(State::Populated).unwrap();
            }
            if prepare > 1 {
                node.transition(State::Ran).unwrap();
            }
            node.transition(State::Error).unwrap();
            assert_eq!(node.state, State::Error);
        }
    }

    #[test]
    fn hashid_reproducible_for_same_config() {
        let mut args = Args::new();
        args.insert("flag".into(), serde_json::json!("-O2"));

        let a = Node::new("main.c|cc", NodeKind::Bundle, args.clone());
        let b = Node::new("main.c|cc", NodeKind::Bundle, args);
        assert_eq!(a.hashid, b.hashid);
    }
}
