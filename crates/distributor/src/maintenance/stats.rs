//! Per-node maintenance load
//!
//! The tracker is reset at the start of every pass and only grows during
//! it, as the scheduler accepts operations. Priority generation reads it
//! as a backpressure signal.

use std::collections::BTreeMap;

use bucket_core::NodeIndex;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

/// Pending maintenance work touching one node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeMaintenanceStats {
    pub pending_merge: u64,
    pub pending_copy_in: u64,
    pub pending_copy_out: u64,
    pub pending_gc: u64,
}

impl NodeMaintenanceStats {
    pub fn total(&self) -> u64 {
        self.pending_merge + self.pending_copy_in + self.pending_copy_out + self.pending_gc
    }
}

/// Counter to bump
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MaintenanceKind {
    Merge,
    CopyIn,
    CopyOut,
    GarbageCollect,
}

/// Read access to per-node load
pub trait NodeLoad {
    /// Load of a node; zero for nodes never incremented
    fn node_stats(&self, node: NodeIndex) -> NodeMaintenanceStats;
}

#[derive(Default)]
pub struct NodeMaintenanceStatsTracker {
    nodes: RwLock<BTreeMap<NodeIndex, NodeMaintenanceStats>>,
}

impl NodeMaintenanceStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn increment(&self, node: NodeIndex, kind: MaintenanceKind) {
        let mut nodes = self.nodes.write();
        let stats = nodes.entry(node).or_default();
        match kind {
            MaintenanceKind::Merge => stats.pending_merge += 1,
            MaintenanceKind::CopyIn => stats.pending_copy_in += 1,
            MaintenanceKind::CopyOut => stats.pending_copy_out += 1,
            MaintenanceKind::GarbageCollect => stats.pending_gc += 1,
        }
    }

    pub fn reset(&self) {
        self.nodes.write().clear();
    }

    pub fn snapshot(&self) -> NodeStatsSnapshot {
        NodeStatsSnapshot {
            nodes: self.nodes.read().clone(),
        }
    }
}

impl NodeLoad for NodeMaintenanceStatsTracker {
    fn node_stats(&self, node: NodeIndex) -> NodeMaintenanceStats {
        self.nodes.read().get(&node).copied().unwrap_or_default()
    }
}

/// Frozen copy of the tracker
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatsSnapshot {
    nodes: BTreeMap<NodeIndex, NodeMaintenanceStats>,
}

impl NodeStatsSnapshot {
    pub fn iter(&self) -> impl Iterator<Item = (&NodeIndex, &NodeMaintenanceStats)> {
        self.nodes.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

impl NodeLoad for NodeStatsSnapshot {
    fn node_stats(&self, node: NodeIndex) -> NodeMaintenanceStats {
        self.nodes.get(&node).copied().unwrap_or_default()
    }
}

impl FromIterator<(NodeIndex, NodeMaintenanceStats)> for NodeStatsSnapshot {
    fn from_iter<T: IntoIterator<Item = (NodeIndex, NodeMaintenanceStats)>>(iter: T) -> Self {
        Self {
            nodes: iter.into_iter().collect(),
        }
    }
}
