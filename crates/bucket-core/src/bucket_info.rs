//! Per-replica bucket summary

use std::fmt;

use serde::{Deserialize, Serialize};

/// Replica metadata as reported by a storage node
///
/// Values are immutable once reported; a newer report replaces the whole
/// value for its `(bucket, node)` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BucketInfo {
    /// Order-independent combination of all document content
    pub checksum: u32,
    /// Live documents
    pub document_count: u32,
    /// Bytes of live documents
    pub total_document_size: u64,
    /// Documents plus tombstones
    pub meta_count: u32,
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub ready: bool,
}

impl BucketInfo {
    /// Info with no tombstones (`meta_count == document_count`)
    pub fn new(checksum: u32, document_count: u32, total_document_size: u64) -> Self {
        Self {
            checksum,
            document_count,
            total_document_size,
            meta_count: document_count,
            active: false,
            ready: false,
        }
    }

    pub fn with_meta_count(mut self, meta_count: u32) -> Self {
        self.meta_count = meta_count;
        self
    }

    pub fn with_flags(mut self, active: bool, ready: bool) -> Self {
        self.active = active;
        self.ready = ready;
        self
    }

    /// Reserved sentinel meaning "known to exist, empty"
    pub fn empty_with_metadata() -> Self {
        Self {
            checksum: 1,
            document_count: 0,
            total_document_size: 0,
            meta_count: 1,
            active: false,
            ready: false,
        }
    }

    pub fn is_empty_with_metadata(&self) -> bool {
        self.checksum == 1 && self.meta_count == 1 && self.document_count == 0
    }

    /// A zero checksum is never produced by a storage node; it marks a
    /// default-constructed value
    pub fn valid(&self) -> bool {
        self.checksum != 0
    }

    /// Checksum, meta count and document count all match
    pub fn in_sync(&self, other: &BucketInfo) -> bool {
        self.checksum == other.checksum
            && self.meta_count == other.meta_count
            && self.document_count == other.document_count
    }

    /// Meta entries that are not live documents
    pub fn tombstone_count(&self) -> u32 {
        self.meta_count.saturating_sub(self.document_count)
    }
}

impl fmt::Display for BucketInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty_with_metadata() {
            return write!(f, "BucketInfo(empty)");
        }
        write!(
            f,
            "BucketInfo(crc 0x{:x}, docs {}/{}, size {}{}{})",
            self.checksum,
            self.document_count,
            self.meta_count,
            self.total_document_size,
            if self.active { ", active" } else { "" },
            if self.ready { ", ready" } else { "" },
        )
    }
}
