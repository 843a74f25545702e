//! Maintenance priority generation
//!
//! Decides, per bucket, which single operation brings it closest to the
//! desired state and how urgently. Decisions are pure: the same replica
//! sets and node load always give the same answer.

use std::collections::HashMap;
use std::fmt;

use bucket_core::{BucketId, BucketInfo, Replica, ReplicaSet, MAX_USED_BITS};
use serde::{Deserialize, Serialize};

use super::stats::NodeLoad;
use crate::bucketdb::BucketSnapshot;
use crate::config::MaintenanceConfig;

/// Priority levels, `None` lowest
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenancePriority {
    None,
    Low,
    Medium,
    High,
}

impl MaintenancePriority {
    /// One level down; `Low` and `None` stay where they are
    pub fn lowered(self) -> Self {
        match self {
            MaintenancePriority::High => MaintenancePriority::Medium,
            MaintenancePriority::Medium => MaintenancePriority::Low,
            other => other,
        }
    }
}

impl fmt::Display for MaintenancePriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MaintenancePriority::None => write!(f, "none"),
            MaintenancePriority::Low => write!(f, "low"),
            MaintenancePriority::Medium => write!(f, "medium"),
            MaintenancePriority::High => write!(f, "high"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceOperationType {
    /// Reconcile divergent replicas
    MergeBucket,
    /// Bucket is over the size or document threshold
    SplitBucket,
    /// Bucket and its sibling are small enough to collapse into the parent
    JoinBucket,
    /// Fewer legal replicas than the redundancy target
    CopyBucket,
    /// No legal replicas remain, or more than the target
    DeleteBucket,
    /// Tombstones outweigh live documents
    GarbageCollect,
    NoOp,
}

impl fmt::Display for MaintenanceOperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MaintenanceOperationType::MergeBucket => "merge_bucket",
            MaintenanceOperationType::SplitBucket => "split_bucket",
            MaintenanceOperationType::JoinBucket => "join_bucket",
            MaintenanceOperationType::CopyBucket => "copy_bucket",
            MaintenanceOperationType::DeleteBucket => "delete_bucket",
            MaintenanceOperationType::GarbageCollect => "garbage_collect",
            MaintenanceOperationType::NoOp => "no_op",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaintenancePriorityAndType {
    pub priority: MaintenancePriority,
    pub op: MaintenanceOperationType,
}

impl MaintenancePriorityAndType {
    pub fn new(priority: MaintenancePriority, op: MaintenanceOperationType) -> Self {
        Self { priority, op }
    }

    pub fn none() -> Self {
        Self::new(MaintenancePriority::None, MaintenanceOperationType::NoOp)
    }

    pub fn is_none(&self) -> bool {
        self.priority == MaintenancePriority::None
    }
}

pub struct PriorityGenerator {
    redundancy: usize,
    config: MaintenanceConfig,
}

impl PriorityGenerator {
    pub fn new(redundancy: u32, config: MaintenanceConfig) -> Self {
        Self {
            redundancy: redundancy as usize,
            config,
        }
    }

    /// Decide for a bucket in a snapshot; absent buckets get no work
    pub fn prioritize(
        &self,
        bucket: &BucketId,
        snapshot: &BucketSnapshot,
        load: &dyn NodeLoad,
    ) -> MaintenancePriorityAndType {
        let sibling = bucket.sibling().and_then(|s| snapshot.get(&s));
        self.prioritize_replicas(bucket, snapshot.get(bucket), sibling, load)
    }

    /// Decide from a bucket's replica set and its sibling's, if any
    pub fn prioritize_replicas(
        &self,
        bucket: &BucketId,
        replicas: Option<&ReplicaSet>,
        sibling: Option<&ReplicaSet>,
        load: &dyn NodeLoad,
    ) -> MaintenancePriorityAndType {
        let replicas = match replicas {
            Some(r) if !r.is_empty() => r,
            _ => return MaintenancePriorityAndType::none(),
        };

        let legal = replicas.legal_count();
        if legal == 0 {
            return MaintenancePriorityAndType::new(
                MaintenancePriority::Medium,
                MaintenanceOperationType::DeleteBucket,
            );
        }
        if legal < self.redundancy {
            let priority = if self.redundancy - legal >= 2 {
                MaintenancePriority::High
            } else {
                MaintenancePriority::Medium
            };
            return MaintenancePriorityAndType::new(priority, MaintenanceOperationType::CopyBucket);
        }

        let trusted: Vec<&Replica> = replicas.trusted_legal().collect();
        if let Some(decision) = self.check_merge(&trusted, load) {
            return decision;
        }
        if legal > self.redundancy {
            return MaintenancePriorityAndType::new(
                MaintenancePriority::Low,
                MaintenanceOperationType::DeleteBucket,
            );
        }

        // Without a trusted replica there is nothing authoritative to size
        let Some(reference) = trusted.first().map(|r| r.info) else {
            return MaintenancePriorityAndType::none();
        };
        let largest_size = trusted
            .iter()
            .map(|r| r.info.total_document_size)
            .max()
            .unwrap_or(reference.total_document_size);

        if let Some(decision) = self.check_split(bucket, &reference, largest_size) {
            return decision;
        }
        if let Some(decision) = self.check_join(bucket, &reference, largest_size, sibling) {
            return decision;
        }
        if let Some(decision) = self.check_gc(&reference) {
            return decision;
        }
        MaintenancePriorityAndType::none()
    }

    /// Merge when trusted legal replicas disagree
    ///
    /// Untrusted replicas carry no authoritative content, so both the
    /// disagreement and the majority it is measured against count trusted
    /// legal replicas only.
    fn check_merge(
        &self,
        trusted: &[&Replica],
        load: &dyn NodeLoad,
    ) -> Option<MaintenancePriorityAndType> {
        let mut groups: HashMap<(u32, u32, u32), usize> = HashMap::new();
        for replica in trusted {
            let info = &replica.info;
            *groups
                .entry((info.checksum, info.meta_count, info.document_count))
                .or_default() += 1;
        }
        if groups.len() <= 1 {
            return None;
        }

        let largest = groups.values().copied().max().unwrap_or(0);
        let disagreeing = trusted.len() - largest;
        let mut priority = if disagreeing * 2 > trusted.len() {
            MaintenancePriority::High
        } else {
            MaintenancePriority::Medium
        };

        let ceiling = self.config.merge_backpressure_ceiling;
        if trusted
            .iter()
            .any(|r| load.node_stats(r.node).pending_merge > ceiling)
        {
            priority = priority.lowered();
        }
        Some(MaintenancePriorityAndType::new(
            priority,
            MaintenanceOperationType::MergeBucket,
        ))
    }

    fn check_split(
        &self,
        bucket: &BucketId,
        info: &BucketInfo,
        size: u64,
    ) -> Option<MaintenancePriorityAndType> {
        if bucket.used_bits() >= MAX_USED_BITS {
            return None;
        }
        let count_limit = self.config.split_document_count;
        let size_limit = self.config.split_total_size;
        let over_count = count_limit > 0 && info.document_count > count_limit;
        let over_size = size_limit > 0 && size > size_limit;
        if !over_count && !over_size {
            return None;
        }

        let mut ratio: f64 = 0.0;
        if count_limit > 0 {
            ratio = ratio.max(info.document_count as f64 / count_limit as f64);
        }
        if size_limit > 0 {
            ratio = ratio.max(size as f64 / size_limit as f64);
        }
        let priority = if ratio >= 2.0 {
            MaintenancePriority::High
        } else {
            MaintenancePriority::Medium
        };
        Some(MaintenancePriorityAndType::new(
            priority,
            MaintenanceOperationType::SplitBucket,
        ))
    }

    /// Join when both siblings are small and the sibling needs no other
    /// work
    ///
    /// The sibling must be at the redundancy target with agreeing trusted
    /// replicas, so a join never consumes a bucket that is also due for a
    /// copy, merge or delete.
    fn check_join(
        &self,
        bucket: &BucketId,
        info: &BucketInfo,
        size: u64,
        sibling: Option<&ReplicaSet>,
    ) -> Option<MaintenancePriorityAndType> {
        if bucket.used_bits() <= self.config.min_used_bits {
            return None;
        }
        if !self.below_join(info.document_count, size) {
            return None;
        }
        let sibling = sibling?;
        if sibling.legal_count() != self.redundancy {
            return None;
        }
        let sibling_info = consensus(sibling)?;
        let sibling_size = sibling
            .trusted_legal()
            .map(|r| r.info.total_document_size)
            .max()
            .unwrap_or(sibling_info.total_document_size);
        if !self.below_join(sibling_info.document_count, sibling_size) {
            return None;
        }
        Some(MaintenancePriorityAndType::new(
            MaintenancePriority::Low,
            MaintenanceOperationType::JoinBucket,
        ))
    }

    fn below_join(&self, document_count: u32, size: u64) -> bool {
        document_count < self.config.join_document_count && size < self.config.join_total_size
    }

    fn check_gc(&self, info: &BucketInfo) -> Option<MaintenancePriorityAndType> {
        let live = info.document_count.max(1) as f64;
        if info.tombstone_count() > 0 && info.meta_count as f64 > live * self.config.gc_meta_ratio {
            return Some(MaintenancePriorityAndType::new(
                MaintenancePriority::Low,
                MaintenanceOperationType::GarbageCollect,
            ));
        }
        None
    }
}

/// Agreed info of a replica set's trusted legal replicas, if they agree
fn consensus(replicas: &ReplicaSet) -> Option<BucketInfo> {
    let mut trusted = replicas.trusted_legal();
    let first = trusted.next()?.info;
    trusted
        .all(|r| r.info.in_sync(&first))
        .then_some(first)
}
