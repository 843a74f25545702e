//! Storage node states
//!
//! Node up/down changes are an input to the distributor; this registry holds
//! the current view and answers who may report and who may receive copies.

use std::collections::BTreeMap;

use bucket_core::NodeIndex;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Node state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Available, accepts reports and new replicas
    Up,
    /// Unavailable; its replicas are dropped from the database
    Down,
    /// Temporarily unavailable; replicas are kept but reports are ignored
    Maintenance,
    /// Being emptied; reports accepted, no new replicas
    Retired,
}

impl NodeState {
    /// Reports from the node are applied to the database
    pub fn accepts_reports(&self) -> bool {
        matches!(self, NodeState::Up | NodeState::Retired)
    }

    /// The node may be chosen as a copy target
    pub fn accepts_copies(&self) -> bool {
        matches!(self, NodeState::Up)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Up => write!(f, "up"),
            NodeState::Down => write!(f, "down"),
            NodeState::Maintenance => write!(f, "maintenance"),
            NodeState::Retired => write!(f, "retired"),
        }
    }
}

/// A node's state and when it last changed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeEntry {
    pub state: NodeState,
    pub changed_at: DateTime<Utc>,
}

/// Registry of known storage nodes
pub struct NodeStates {
    nodes: RwLock<BTreeMap<NodeIndex, NodeEntry>>,
}

impl NodeStates {
    /// Nodes `0..node_count`, all up
    pub fn new(node_count: u16) -> Self {
        let now = Utc::now();
        let nodes = (0..node_count)
            .map(|node| {
                (
                    node,
                    NodeEntry {
                        state: NodeState::Up,
                        changed_at: now,
                    },
                )
            })
            .collect();
        Self {
            nodes: RwLock::new(nodes),
        }
    }

    pub fn is_known(&self, node: NodeIndex) -> bool {
        self.nodes.read().contains_key(&node)
    }

    pub fn get(&self, node: NodeIndex) -> Option<NodeState> {
        self.nodes.read().get(&node).map(|e| e.state)
    }

    /// Set a node's state, registering the node if it is new
    ///
    /// Returns the previous state.
    pub fn set(&self, node: NodeIndex, state: NodeState) -> Option<NodeState> {
        let mut nodes = self.nodes.write();
        let previous = nodes.insert(
            node,
            NodeEntry {
                state,
                changed_at: Utc::now(),
            },
        );
        let previous = previous.map(|e| e.state);
        if previous != Some(state) {
            info!(node, %state, "Node state changed from {:?}", previous);
        }
        previous
    }

    /// Nodes that may receive copies, ascending
    pub fn copy_targets(&self) -> Vec<NodeIndex> {
        self.nodes
            .read()
            .iter()
            .filter(|(_, e)| e.state.accepts_copies())
            .map(|(node, _)| *node)
            .collect()
    }

    pub fn snapshot(&self) -> BTreeMap<NodeIndex, NodeEntry> {
        self.nodes.read().clone()
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}
