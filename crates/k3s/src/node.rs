//! Cluster node model and state machine.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Attempted node state transitions that violate the state machine.
#[derive(Debug, Error)]
pub enum StateError {
    /// States only move forward; the one backward edge is `Failed` → retry.
    #[error("node {node}: cannot regress from {from} to {to}")]
    Regression {
        node: String,
        from: NodeState,
        to: NodeState,
    },

    /// Retry is only meaningful from `Failed`.
    #[error("node {node}: retry requested but state is {state}, not failed")]
    NotFailed { node: String, state: NodeState },
}

/// Role a node plays in the cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeRole {
    /// Hosts the cluster API and scheduler (k3s server).
    Server,
    /// Joins the cluster to run workloads (k3s agent).
    Agent,
}

impl std::fmt::Display for NodeRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

/// Lifecycle state of a node during deployment.
///
/// Ordered: a node only ever moves to a later state, except for the explicit
/// `Failed` → retry edge back to the last good state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// No VM exists yet.
    Unprovisioned,
    /// VM clone in progress.
    Provisioning,
    /// VM is up and reachable over SSH.
    NetworkReady,
    /// Control-plane role installed and ready.
    Bootstrapped,
    /// Agent role install in progress.
    AgentInstalling,
    /// Agent has joined the cluster.
    Joined,
    /// Node reports Ready in the cluster node list.
    Ready,
    /// The current phase failed; retry returns to the last good state.
    Failed,
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unprovisioned => "unprovisioned",
            Self::Provisioning => "provisioning",
            Self::NetworkReady => "network-ready",
            Self::Bootstrapped => "bootstrapped",
            Self::AgentInstalling => "agent-installing",
            Self::Joined => "joined",
            Self::Ready => "ready",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// One lab node, owned by the driver and mutated only by the phase that is
/// responsible for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    /// Node name (also the VM name and cluster node name).
    pub name: String,
    /// Cluster role.
    pub role: NodeRole,
    /// Resolved address, once discovered.
    pub address: Option<String>,
    /// Current lifecycle state.
    pub state: NodeState,
    /// Last state before a failure, for retry.
    last_good: NodeState,
}

impl Node {
    /// Create a node in `Unprovisioned` state.
    #[must_use]
    pub fn new(name: impl Into<String>, role: NodeRole) -> Self {
        Self {
            name: name.into(),
            role,
            address: None,
            state: NodeState::Unprovisioned,
            last_good: NodeState::Unprovisioned,
        }
    }

    /// Whether this node has reached `state` (a failed node has reached
    /// nothing).
    #[must_use]
    pub fn has_reached(&self, state: NodeState) -> bool {
        self.state != NodeState::Failed && self.state >= state
    }

    /// Move forward to `next`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::Regression`] if `next` is not strictly later
    /// than the current state.
    pub fn advance(&mut self, next: NodeState) -> Result<(), StateError> {
        if next == NodeState::Failed {
            return Err(StateError::Regression {
                node: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        if self.state == NodeState::Failed || next <= self.state {
            return Err(StateError::Regression {
                node: self.name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        self.last_good = next;
        Ok(())
    }

    /// Mark the node failed, remembering the last good state.
    pub fn fail(&mut self) {
        if self.state != NodeState::Failed {
            self.last_good = self.state;
            self.state = NodeState::Failed;
        }
    }

    /// Return a failed node to its last good state so the failed phase can
    /// run again.
    ///
    /// # Errors
    ///
    /// Returns [`StateError::NotFailed`] unless the node is `Failed`.
    pub fn retry(&mut self) -> Result<NodeState, StateError> {
        if self.state != NodeState::Failed {
            return Err(StateError::NotFailed {
                node: self.name.clone(),
                state: self.state,
            });
        }
        self.state = self.last_good;
        Ok(self.state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_states_advance_monotonically() {
        let mut node = Node::new("lab-server", NodeRole::Server);
        node.advance(NodeState::Provisioning).unwrap();
        node.advance(NodeState::NetworkReady).unwrap();
        node.advance(NodeState::Bootstrapped).unwrap();
        assert_eq!(node.state, NodeState::Bootstrapped);
    }

    #[test]
    fn test_regression_is_rejected() {
        let mut node = Node::new("lab-agent1", NodeRole::Agent);
        node.advance(NodeState::NetworkReady).unwrap();
        let err = node.advance(NodeState::Provisioning).unwrap_err();
        assert!(matches!(err, StateError::Regression { .. }));
        assert_eq!(node.state, NodeState::NetworkReady);
    }

    #[test]
    fn test_same_state_is_rejected() {
        let mut node = Node::new("lab-agent1", NodeRole::Agent);
        node.advance(NodeState::NetworkReady).unwrap();
        assert!(node.advance(NodeState::NetworkReady).is_err());
    }

    #[test]
    fn test_failed_retry_returns_to_last_good() {
        let mut node = Node::new("lab-agent1", NodeRole::Agent);
        node.advance(NodeState::NetworkReady).unwrap();
        node.fail();
        assert_eq!(node.state, NodeState::Failed);
        assert!(!node.has_reached(NodeState::NetworkReady));

        let resumed = node.retry().unwrap();
        assert_eq!(resumed, NodeState::NetworkReady);

        // Can move forward again after the retry.
        node.advance(NodeState::AgentInstalling).unwrap();
    }

    #[test]
    fn test_retry_requires_failed() {
        let mut node = Node::new("lab-server", NodeRole::Server);
        assert!(matches!(
            node.retry().unwrap_err(),
            StateError::NotFailed { .. }
        ));
    }

    #[test]
    fn test_has_reached() {
        let mut node = Node::new("lab-server", NodeRole::Server);
        assert!(!node.has_reached(NodeState::Bootstrapped));
        node.advance(NodeState::Provisioning).unwrap();
        node.advance(NodeState::NetworkReady).unwrap();
        node.advance(NodeState::Bootstrapped).unwrap();
        assert!(node.has_reached(NodeState::Bootstrapped));
        assert!(node.has_reached(NodeState::NetworkReady));
        assert!(!node.has_reached(NodeState::Ready));
    }
}
