//! Bucket database
//!
//! Ordered map of bucket to replica set. All mutation goes through one
//! exclusive lock; readers either copy a single entry or take a snapshot,
//! so no lock is ever held across task dispatch.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::Arc;

use bucket_core::{prefix_contains, BucketId, ContainmentFn, DiskIndex, NodeIndex, Replica, ReplicaSet};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use super::report::{BucketReport, ReportError};
use crate::context::DistributorContext;
use crate::node_state::NodeStates;

/// What an applied report did to the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateOutcome {
    /// First replica of a new bucket
    Created,
    /// New replica on an existing bucket
    Added,
    /// Newer report replaced the node's replica
    Replaced,
    /// Report was not newer than the stored one and was discarded
    Stale { stored_seq: u64 },
}

impl UpdateOutcome {
    pub fn is_applied(&self) -> bool {
        !matches!(self, UpdateOutcome::Stale { .. })
    }
}

pub struct BucketDatabase {
    ctx: DistributorContext,
    nodes: Arc<NodeStates>,
    contains: ContainmentFn,
    buckets: RwLock<BTreeMap<BucketId, ReplicaSet>>,
    /// Sequence of the last removal per `(bucket, node)`; always locked
    /// after `buckets`
    removed: RwLock<HashMap<(BucketId, NodeIndex), u64>>,
}

impl BucketDatabase {
    /// Database using bit-prefix containment for range queries
    pub fn new(ctx: DistributorContext, nodes: Arc<NodeStates>) -> Self {
        Self::with_containment(ctx, nodes, prefix_contains)
    }

    pub fn with_containment(
        ctx: DistributorContext,
        nodes: Arc<NodeStates>,
        contains: ContainmentFn,
    ) -> Self {
        Self {
            ctx,
            nodes,
            contains,
            buckets: RwLock::new(BTreeMap::new()),
            removed: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, bucket: &BucketId) -> Option<ReplicaSet> {
        self.buckets.read().get(bucket).cloned()
    }

    /// Whether the bucket's replica set still equals `expected`
    ///
    /// An absent bucket matches an empty set.
    pub fn matches(&self, bucket: &BucketId, expected: &ReplicaSet) -> bool {
        match self.buckets.read().get(bucket) {
            Some(current) => current == expected,
            None => expected.is_empty(),
        }
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    /// Apply one node's report for one bucket
    ///
    /// A report whose sequence number is not greater than the stored one
    /// for the same `(node, bucket)` is discarded, so duplicates and
    /// reordered deliveries leave the database unchanged. The stored
    /// sequence survives a removal of the replica.
    ///
    /// The node's state is checked under the write lock, so a report can
    /// never land after [`BucketDatabase::remove_node`] for a node that
    /// was already marked unavailable.
    pub fn update(&self, report: &BucketReport) -> Result<UpdateOutcome, ReportError> {
        let replica = Replica::new(
            report.node,
            report.disk,
            report.info,
            report.trusted,
            report.report_seq,
        );

        let result = {
            let mut buckets = self.buckets.write();
            self.validate(report).map(|()| {
                let mut removed = self.removed.write();
                let key = (report.bucket, report.node);
                let stored = buckets
                    .get(&report.bucket)
                    .and_then(|replicas| replicas.get(report.node))
                    .map(|r| r.report_seq)
                    .or_else(|| removed.get(&key).copied());
                match stored {
                    Some(stored_seq) if stored_seq >= report.report_seq => {
                        UpdateOutcome::Stale { stored_seq }
                    }
                    _ => {
                        removed.remove(&key);
                        match buckets.entry(report.bucket) {
                            Entry::Vacant(slot) => {
                                slot.insert(std::iter::once(replica).collect());
                                UpdateOutcome::Created
                            }
                            Entry::Occupied(mut slot) => match slot.get_mut().upsert(replica) {
                                Some(_) => UpdateOutcome::Replaced,
                                None => UpdateOutcome::Added,
                            },
                        }
                    }
                }
            })
        };

        match result {
            Err(ref e) => warn!(
                node = report.node,
                bucket = %report.bucket,
                "Rejected bucket report: {}",
                e
            ),
            Ok(UpdateOutcome::Stale { stored_seq }) => debug!(
                node = report.node,
                bucket = %report.bucket,
                seq = report.report_seq,
                stored_seq,
                "Discarded stale bucket report"
            ),
            Ok(outcome) => trace!(
                node = report.node,
                bucket = %report.bucket,
                seq = report.report_seq,
                info = %report.info,
                "Applied bucket report: {:?}",
                outcome
            ),
        }
        result
    }

    fn validate(&self, report: &BucketReport) -> Result<(), ReportError> {
        let state = self
            .nodes
            .get(report.node)
            .ok_or(ReportError::UnknownNode(report.node))?;
        if !state.accepts_reports() {
            return Err(ReportError::NodeUnavailable {
                node: report.node,
                state,
            });
        }
        let disks_per_node = self.ctx.config.cluster.disks_per_node;
        if let DiskIndex::Disk(disk) = report.disk {
            if disk >= disks_per_node {
                return Err(ReportError::DiskOutOfRange {
                    node: report.node,
                    disk,
                    disks_per_node,
                });
            }
        }
        Ok(())
    }

    /// Drop a bucket and all its replicas
    pub fn remove(&self, bucket: &BucketId) -> Option<ReplicaSet> {
        let removed = self.buckets.write().remove(bucket);
        if removed.is_some() {
            debug!(bucket = %bucket, "Removed bucket");
        }
        removed
    }

    /// Apply a node's report that it no longer holds a bucket
    ///
    /// The removal is ordered against the node's other reports for the
    /// bucket by `report_seq`: a removal older than the stored replica is
    /// ignored, and reports not newer than the removal are discarded
    /// afterwards. The bucket goes away with its last replica.
    pub fn remove_replica(
        &self,
        bucket: &BucketId,
        node: NodeIndex,
        report_seq: u64,
    ) -> Option<Replica> {
        let mut buckets = self.buckets.write();
        let mut removed = self.removed.write();
        let key = (*bucket, node);
        if removed.get(&key).is_some_and(|seq| *seq >= report_seq) {
            return None;
        }
        let replicas = buckets.get_mut(bucket);
        if let Some(stored) = replicas.as_ref().and_then(|r| r.get(node)) {
            if stored.report_seq > report_seq {
                debug!(node, bucket = %bucket, seq = report_seq, "Discarded stale removal");
                return None;
            }
        }
        removed.insert(key, report_seq);

        let replicas = replicas?;
        let replica = replicas.remove(node);
        if replicas.is_empty() {
            buckets.remove(bucket);
        }
        replica
    }

    /// Drop every replica held by a node, returning how many were dropped
    ///
    /// The node's removal sequence numbers go too: a node coming back
    /// starts a fresh report sequence.
    pub fn remove_node(&self, node: NodeIndex) -> usize {
        let mut removed = 0;
        let mut buckets = self.buckets.write();
        buckets.retain(|_, replicas| {
            if replicas.remove(node).is_some() {
                removed += 1;
            }
            !replicas.is_empty()
        });
        self.removed.write().retain(|(_, n), _| *n != node);
        drop(buckets);
        if removed > 0 {
            debug!(node, removed, "Removed node replicas");
        }
        removed
    }

    /// Lazy, restartable iteration over buckets contained by `prefix`
    pub fn range_iterate(&self, prefix: BucketId) -> BucketRange<'_> {
        BucketRange {
            db: self,
            prefix,
            last: None,
            done: false,
        }
    }

    /// Point-in-time copy of the buckets contained by `region`
    /// (everything when `None`)
    pub fn snapshot(&self, region: Option<BucketId>) -> BucketSnapshot {
        let buckets = self.buckets.read();
        let buckets = match region {
            None => buckets.clone(),
            Some(prefix) => buckets
                .iter()
                .filter(|(bucket, _)| (self.contains)(&prefix, bucket))
                .map(|(bucket, replicas)| (*bucket, replicas.clone()))
                .collect(),
        };
        BucketSnapshot { buckets }
    }
}

/// Cursor over a bucket range
///
/// Each step takes the read lock only long enough to find the next entry
/// after the last one yielded, so concurrent updates are visible to the
/// remainder of the walk.
pub struct BucketRange<'a> {
    db: &'a BucketDatabase,
    prefix: BucketId,
    last: Option<BucketId>,
    done: bool,
}

impl BucketRange<'_> {
    pub fn prefix(&self) -> BucketId {
        self.prefix
    }

    /// Start over from the first bucket
    pub fn restart(&mut self) {
        self.last = None;
        self.done = false;
    }
}

impl Iterator for BucketRange<'_> {
    type Item = BucketId;

    fn next(&mut self) -> Option<BucketId> {
        if self.done {
            return None;
        }
        let buckets = self.db.buckets.read();
        let lower = match self.last {
            None => Bound::Unbounded,
            Some(last) => Bound::Excluded(last),
        };
        let found = buckets
            .range((lower, Bound::Unbounded))
            .map(|(bucket, _)| *bucket)
            .find(|bucket| (self.db.contains)(&self.prefix, bucket));
        match found {
            Some(bucket) => self.last = Some(bucket),
            None => self.done = true,
        }
        found
    }
}

/// Immutable copy of part of the database, in bucket order
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BucketSnapshot {
    buckets: BTreeMap<BucketId, ReplicaSet>,
}

impl BucketSnapshot {
    pub fn get(&self, bucket: &BucketId) -> Option<&ReplicaSet> {
        self.buckets.get(bucket)
    }

    pub fn contains(&self, bucket: &BucketId) -> bool {
        self.buckets.contains_key(bucket)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BucketId, &ReplicaSet)> {
        self.buckets.iter()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl FromIterator<(BucketId, ReplicaSet)> for BucketSnapshot {
    fn from_iter<T: IntoIterator<Item = (BucketId, ReplicaSet)>>(iter: T) -> Self {
        Self {
            buckets: iter.into_iter().collect(),
        }
    }
}
