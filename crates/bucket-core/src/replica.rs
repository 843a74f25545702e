//! Replicas and replica sets

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::bucket_info::BucketInfo;

/// Storage node index
pub type NodeIndex = u16;

/// Disk slot of a replica on its node
///
/// Reports encode "no disk" as `0xff`; it is decoded into
/// [`DiskIndex::Unassigned`] and never compared as a number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum DiskIndex {
    Disk(u8),
    Unassigned,
}

impl DiskIndex {
    /// Wire encoding of [`DiskIndex::Unassigned`]
    pub const UNASSIGNED_RAW: u8 = 0xff;

    pub fn from_raw(raw: u8) -> Self {
        if raw == Self::UNASSIGNED_RAW {
            DiskIndex::Unassigned
        } else {
            DiskIndex::Disk(raw)
        }
    }

    pub fn raw(&self) -> u8 {
        match self {
            DiskIndex::Disk(d) => *d,
            DiskIndex::Unassigned => Self::UNASSIGNED_RAW,
        }
    }

    pub fn is_assigned(&self) -> bool {
        matches!(self, DiskIndex::Disk(_))
    }
}

impl From<u8> for DiskIndex {
    fn from(raw: u8) -> Self {
        Self::from_raw(raw)
    }
}

impl From<DiskIndex> for u8 {
    fn from(disk: DiskIndex) -> Self {
        disk.raw()
    }
}

impl fmt::Display for DiskIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskIndex::Disk(d) => write!(f, "disk {}", d),
            DiskIndex::Unassigned => write!(f, "unassigned"),
        }
    }
}

/// One node's copy of a bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Replica {
    pub node: NodeIndex,
    pub disk: DiskIndex,
    pub info: BucketInfo,
    /// Info is authoritative for divergence comparison
    pub trusted: bool,
    /// Sequence number of the report this replica came from
    pub report_seq: u64,
}

impl Replica {
    pub fn new(node: NodeIndex, disk: DiskIndex, info: BucketInfo, trusted: bool, report_seq: u64) -> Self {
        Self {
            node,
            disk,
            info,
            trusted,
            report_seq,
        }
    }

    /// A replica without a disk is illegal
    pub fn is_legal(&self) -> bool {
        self.disk.is_assigned()
    }
}

/// Replicas of one bucket, ordered by node index, at most one per node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaSet {
    replicas: Vec<Replica>,
}

impl ReplicaSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.replicas.len()
    }

    pub fn is_empty(&self) -> bool {
        self.replicas.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter()
    }

    pub fn get(&self, node: NodeIndex) -> Option<&Replica> {
        self.position(node).ok().map(|i| &self.replicas[i])
    }

    /// Insert or replace the replica for its node
    pub fn upsert(&mut self, replica: Replica) -> Option<Replica> {
        match self.position(replica.node) {
            Ok(i) => Some(std::mem::replace(&mut self.replicas[i], replica)),
            Err(i) => {
                self.replicas.insert(i, replica);
                None
            }
        }
    }

    pub fn remove(&mut self, node: NodeIndex) -> Option<Replica> {
        self.position(node).ok().map(|i| self.replicas.remove(i))
    }

    pub fn nodes(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.replicas.iter().map(|r| r.node)
    }

    pub fn legal(&self) -> impl Iterator<Item = &Replica> {
        self.replicas.iter().filter(|r| r.is_legal())
    }

    pub fn legal_count(&self) -> usize {
        self.legal().count()
    }

    /// Legal replicas whose info is authoritative
    pub fn trusted_legal(&self) -> impl Iterator<Item = &Replica> {
        self.legal().filter(|r| r.trusted)
    }

    pub fn has_illegal(&self) -> bool {
        self.replicas.iter().any(|r| !r.is_legal())
    }

    fn position(&self, node: NodeIndex) -> Result<usize, usize> {
        self.replicas.binary_search_by_key(&node, |r| r.node)
    }
}

impl FromIterator<Replica> for ReplicaSet {
    fn from_iter<I: IntoIterator<Item = Replica>>(iter: I) -> Self {
        let mut set = ReplicaSet::new();
        for replica in iter {
            set.upsert(replica);
        }
        set
    }
}
