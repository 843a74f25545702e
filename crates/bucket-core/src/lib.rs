//! Bucket model
//!
//! Value types shared by the bucket database and the maintenance scheduler:
//! - Bucket identifiers and the binary splitting hierarchy
//! - Per-replica bucket info
//! - Replicas and replica sets

pub mod bucket_id;
pub mod bucket_info;
pub mod replica;

// Re-export commonly used types
pub use bucket_id::{prefix_contains, BucketId, BucketIdError, ContainmentFn, MAX_USED_BITS};
pub use bucket_info::BucketInfo;
pub use replica::{DiskIndex, NodeIndex, Replica, ReplicaSet};
