//! Copy target placement

use bucket_core::{NodeIndex, ReplicaSet};

use super::stats::NodeLoad;

/// Placement strategy for new replicas
#[derive(Debug, Clone)]
pub struct PlacementStrategy {
    /// Prefer nodes with fewer incoming copies
    pub load_balance: bool,
}

impl Default for PlacementStrategy {
    fn default() -> Self {
        Self { load_balance: true }
    }
}

impl PlacementStrategy {
    /// Select copy targets for a bucket
    ///
    /// Returns up to `count` candidates that do not already hold a legal
    /// replica. A node holding only an illegal replica may be chosen; the
    /// copy replaces it.
    pub fn select_targets(
        &self,
        replicas: &ReplicaSet,
        candidates: &[NodeIndex],
        load: &dyn NodeLoad,
        count: usize,
    ) -> Vec<NodeIndex> {
        if count == 0 || candidates.is_empty() {
            return Vec::new();
        }

        let mut targets: Vec<NodeIndex> = candidates
            .iter()
            .copied()
            .filter(|node| !replicas.get(*node).is_some_and(|r| r.is_legal()))
            .collect();

        if self.load_balance {
            targets.sort_by_key(|node| (load.node_stats(*node).pending_copy_in, *node));
        } else {
            targets.sort_unstable();
        }
        targets.truncate(count);
        targets
    }
}
