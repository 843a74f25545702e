//! Dispatched maintenance operations
//!
//! An operation carries the replica set it was decided against. When it
//! finally runs it first checks that the database still holds exactly that
//! state; anything else means the decision is stale and the operation does
//! nothing.

use async_trait::async_trait;
use bucket_core::{BucketId, NodeIndex, ReplicaSet};
use serde::Serialize;
use tracing::info;

use super::priority::{MaintenanceOperationType, MaintenancePriority};
use super::stats::MaintenanceKind;
use crate::bucketdb::BucketDatabase;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MaintenanceOperation {
    pub bucket: BucketId,
    pub op: MaintenanceOperationType,
    pub priority: MaintenancePriority,
    /// Replica set the decision was made against
    pub expected: ReplicaSet,
    /// Sibling and its replica set (joins only)
    pub sibling: Option<(BucketId, ReplicaSet)>,
    /// Nodes to receive a new replica (copies only)
    pub targets: Vec<NodeIndex>,
}

impl MaintenanceOperation {
    pub fn new(
        bucket: BucketId,
        op: MaintenanceOperationType,
        priority: MaintenancePriority,
        expected: ReplicaSet,
    ) -> Self {
        Self {
            bucket,
            op,
            priority,
            expected,
            sibling: None,
            targets: Vec::new(),
        }
    }

    pub fn with_sibling(mut self, sibling: BucketId, replicas: ReplicaSet) -> Self {
        self.sibling = Some((sibling, replicas));
        self
    }

    pub fn with_targets(mut self, targets: Vec<NodeIndex>) -> Self {
        self.targets = targets;
        self
    }

    /// Executor key: the bucket, or for joins the parent both siblings
    /// collapse into
    pub fn sequencing_key(&self) -> u64 {
        match self.op {
            MaintenanceOperationType::JoinBucket => self
                .bucket
                .parent()
                .map_or(self.bucket.raw(), |parent| parent.raw()),
            _ => self.bucket.raw(),
        }
    }

    /// Sequencing keys of every bucket this operation touches
    ///
    /// A join touches its parent and both siblings. Any other operation
    /// touches its bucket and conflicts with work keyed by the parent,
    /// which is either a join consuming the bucket or an operation on the
    /// bucket it was split from.
    pub fn conflict_keys(&self) -> Vec<u64> {
        let mut keys = vec![self.sequencing_key()];
        match self.op {
            MaintenanceOperationType::JoinBucket => {
                keys.push(self.bucket.raw());
                if let Some(sibling) = self.bucket.sibling() {
                    keys.push(sibling.raw());
                }
            }
            _ => {
                if let Some(parent) = self.bucket.parent() {
                    keys.push(parent.raw());
                }
            }
        }
        keys
    }

    /// Per-node load this operation puts on the cluster
    pub fn load(&self) -> Vec<(NodeIndex, MaintenanceKind)> {
        match self.op {
            MaintenanceOperationType::MergeBucket => self
                .expected
                .trusted_legal()
                .map(|r| (r.node, MaintenanceKind::Merge))
                .collect(),
            MaintenanceOperationType::CopyBucket => self
                .expected
                .legal()
                .map(|r| (r.node, MaintenanceKind::CopyOut))
                .chain(self.targets.iter().map(|n| (*n, MaintenanceKind::CopyIn)))
                .collect(),
            MaintenanceOperationType::GarbageCollect => self
                .expected
                .legal()
                .map(|r| (r.node, MaintenanceKind::GarbageCollect))
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the database still holds the state this was decided against
    pub fn is_current(&self, db: &BucketDatabase) -> bool {
        if !db.matches(&self.bucket, &self.expected) {
            return false;
        }
        match &self.sibling {
            Some((sibling, replicas)) => db.matches(sibling, replicas),
            None => true,
        }
    }
}

/// Carries out maintenance operations against storage nodes
#[async_trait]
pub trait MaintenanceOperationHandler: Send + Sync + 'static {
    async fn execute(&self, operation: &MaintenanceOperation) -> anyhow::Result<()>;
}

/// Handler that only logs what it would do
#[derive(Debug, Default)]
pub struct LoggingOperationHandler;

#[async_trait]
impl MaintenanceOperationHandler for LoggingOperationHandler {
    async fn execute(&self, operation: &MaintenanceOperation) -> anyhow::Result<()> {
        info!(
            bucket = %operation.bucket,
            op = %operation.op,
            priority = %operation.priority,
            replicas = operation.expected.len(),
            targets = ?operation.targets,
            "Maintenance operation"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributorConfig;
    use crate::context::DistributorContext;
    use crate::node_state::NodeStates;
    use crate::bucketdb::BucketReport;
    use bucket_core::{BucketInfo, DiskIndex, Replica};
    use std::sync::Arc;

    fn replicas(nodes: &[NodeIndex]) -> ReplicaSet {
        nodes
            .iter()
            .map(|n| Replica::new(*n, DiskIndex::Disk(0), BucketInfo::new(1, 1, 1), true, 1))
            .collect()
    }

    #[test]
    fn test_join_keyed_by_parent() {
        let b = BucketId::new(10, 0b10_0000_0001).unwrap();
        let join = MaintenanceOperation::new(
            b,
            MaintenanceOperationType::JoinBucket,
            MaintenancePriority::Low,
            ReplicaSet::new(),
        );
        let sibling_join = MaintenanceOperation::new(
            b.sibling().unwrap(),
            MaintenanceOperationType::JoinBucket,
            MaintenancePriority::Low,
            ReplicaSet::new(),
        );
        assert_eq!(join.sequencing_key(), b.parent().unwrap().raw());
        assert_eq!(join.sequencing_key(), sibling_join.sequencing_key());

        let merge = MaintenanceOperation::new(
            b,
            MaintenanceOperationType::MergeBucket,
            MaintenancePriority::High,
            ReplicaSet::new(),
        );
        assert_eq!(merge.sequencing_key(), b.raw());
    }

    #[test]
    fn test_join_conflicts_with_work_on_either_sibling() {
        let b = BucketId::new(10, 0b10_0000_0001).unwrap();
        let sibling = b.sibling().unwrap();
        let parent = b.parent().unwrap();
        let op = |bucket, kind| {
            MaintenanceOperation::new(bucket, kind, MaintenancePriority::Low, ReplicaSet::new())
        };

        let join = op(b, MaintenanceOperationType::JoinBucket);
        assert_eq!(join.conflict_keys(), vec![parent.raw(), b.raw(), sibling.raw()]);

        // a copy of the sibling shares a key with the join in both directions
        let copy = op(sibling, MaintenanceOperationType::CopyBucket);
        assert_eq!(copy.conflict_keys(), vec![sibling.raw(), parent.raw()]);
        assert!(join.conflict_keys().contains(&copy.sequencing_key()));
        assert!(copy.conflict_keys().contains(&join.sequencing_key()));

        assert_eq!(
            op(BucketId::root(), MaintenanceOperationType::SplitBucket).conflict_keys(),
            vec![BucketId::root().raw()]
        );
    }

    #[test]
    fn test_copy_load() {
        let op = MaintenanceOperation::new(
            BucketId::root(),
            MaintenanceOperationType::CopyBucket,
            MaintenancePriority::High,
            replicas(&[1]),
        )
        .with_targets(vec![4, 6]);
        assert_eq!(
            op.load(),
            vec![
                (1, MaintenanceKind::CopyOut),
                (4, MaintenanceKind::CopyIn),
                (6, MaintenanceKind::CopyIn)
            ]
        );
    }

    #[test]
    fn test_is_current_tracks_bucket_and_sibling() {
        let mut config = DistributorConfig::default();
        config.cluster.node_count = 3;
        let db = BucketDatabase::new(DistributorContext::new(config), Arc::new(NodeStates::new(3)));
        let b = BucketId::new(12, 5).unwrap();
        let s = b.sibling().unwrap();
        let info = BucketInfo::new(1, 1, 1);
        db.update(&BucketReport::new(0, b, info, DiskIndex::Disk(0), 1)).unwrap();
        db.update(&BucketReport::new(0, s, info, DiskIndex::Disk(0), 1)).unwrap();

        let op = MaintenanceOperation::new(
            b,
            MaintenanceOperationType::JoinBucket,
            MaintenancePriority::Low,
            db.get(&b).unwrap(),
        )
        .with_sibling(s, db.get(&s).unwrap());
        assert!(op.is_current(&db));

        // a newer report for the sibling invalidates the join
        db.update(&BucketReport::new(0, s, info, DiskIndex::Disk(0), 2)).unwrap();
        assert!(!op.is_current(&db));

        db.remove(&s);
        let merge = MaintenanceOperation::new(
            b,
            MaintenanceOperationType::MergeBucket,
            MaintenancePriority::Medium,
            db.get(&b).unwrap(),
        );
        assert!(merge.is_current(&db));
        db.remove(&b);
        assert!(!merge.is_current(&db));
    }
}
