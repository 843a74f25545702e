//! In-flight operation tracking
//!
//! An operation is pending from dispatch until its task finishes. Later
//! passes skip keys that are still pending and count their load again
//! after the stats reset.

use std::collections::HashMap;
use std::sync::Arc;

use bucket_core::{BucketId, NodeIndex};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use super::operation::MaintenanceOperation;
use super::priority::{MaintenanceOperationType, MaintenancePriority};
use super::stats::{MaintenanceKind, NodeMaintenanceStatsTracker};

#[derive(Debug, Clone, Serialize)]
pub struct PendingOperation {
    pub key: u64,
    pub bucket: BucketId,
    pub op: MaintenanceOperationType,
    pub priority: MaintenancePriority,
    pub dispatched_at: DateTime<Utc>,
    #[serde(skip)]
    load: Vec<(NodeIndex, MaintenanceKind)>,
}

#[derive(Default)]
pub struct PendingOperations {
    ops: RwLock<HashMap<u64, PendingOperation>>,
}

impl PendingOperations {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an operation; false if its key is already pending
    pub fn insert(&self, operation: &MaintenanceOperation) -> bool {
        let key = operation.sequencing_key();
        let mut ops = self.ops.write();
        if ops.contains_key(&key) {
            return false;
        }
        ops.insert(
            key,
            PendingOperation {
                key,
                bucket: operation.bucket,
                op: operation.op,
                priority: operation.priority,
                dispatched_at: Utc::now(),
                load: operation.load(),
            },
        );
        true
    }

    pub fn is_pending(&self, key: u64) -> bool {
        self.ops.read().contains_key(&key)
    }

    pub fn finish(&self, key: u64) -> Option<PendingOperation> {
        self.ops.write().remove(&key)
    }

    /// Add the load of every pending operation to the tracker
    pub fn replay_load(&self, tracker: &NodeMaintenanceStatsTracker) {
        for pending in self.ops.read().values() {
            for (node, kind) in &pending.load {
                tracker.increment(*node, *kind);
            }
        }
    }

    /// Pending operations, oldest first
    pub fn list(&self) -> Vec<PendingOperation> {
        let mut ops: Vec<_> = self.ops.read().values().cloned().collect();
        ops.sort_by(|a, b| {
            a.dispatched_at
                .cmp(&b.dispatched_at)
                .then(a.bucket.cmp(&b.bucket))
        });
        ops
    }

    pub fn len(&self) -> usize {
        self.ops.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.read().is_empty()
    }
}

/// Clears a pending key when dropped, including when the task panics
pub struct PendingGuard {
    pending: Arc<PendingOperations>,
    key: u64,
}

impl PendingGuard {
    pub fn new(pending: Arc<PendingOperations>, key: u64) -> Self {
        Self { pending, key }
    }
}

impl Drop for PendingGuard {
    fn drop(&mut self) {
        self.pending.finish(self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::maintenance::stats::NodeLoad;
    use bucket_core::{BucketInfo, DiskIndex, Replica, ReplicaSet};

    fn merge_op(id: u64) -> MaintenanceOperation {
        let replicas: ReplicaSet = [0, 1]
            .iter()
            .map(|n| Replica::new(*n, DiskIndex::Disk(0), BucketInfo::new(*n as u32, 1, 1), true, 1))
            .collect();
        MaintenanceOperation::new(
            BucketId::new(16, id).unwrap(),
            MaintenanceOperationType::MergeBucket,
            MaintenancePriority::Medium,
            replicas,
        )
    }

    #[test]
    fn test_insert_once_per_key() {
        let pending = PendingOperations::new();
        let op = merge_op(1);
        assert!(pending.insert(&op));
        assert!(!pending.insert(&op));
        assert!(pending.is_pending(op.sequencing_key()));
        assert_eq!(pending.len(), 1);

        assert!(pending.finish(op.sequencing_key()).is_some());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_replay_load() {
        let pending = PendingOperations::new();
        pending.insert(&merge_op(1));
        pending.insert(&merge_op(2));

        let tracker = NodeMaintenanceStatsTracker::new();
        pending.replay_load(&tracker);
        assert_eq!(tracker.node_stats(0).pending_merge, 2);
        assert_eq!(tracker.node_stats(1).pending_merge, 2);
    }

    #[test]
    fn test_guard_clears_on_drop() {
        let pending = Arc::new(PendingOperations::new());
        let op = merge_op(3);
        pending.insert(&op);
        {
            let _guard = PendingGuard::new(pending.clone(), op.sequencing_key());
        }
        assert!(!pending.is_pending(op.sequencing_key()));
        assert!(pending.list().is_empty());
    }
}
