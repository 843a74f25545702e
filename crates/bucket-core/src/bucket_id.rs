//! Bucket identifiers
//!
//! A bucket is a prefix of the hashed document key-space. The lowest
//! `used_bits` bits of the raw value hold the prefix, the top six bits hold
//! the used-bit count. A bucket with `k` used bits has exactly two children
//! with `k + 1` used bits.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Number of bits reserved for the used-bit count
pub const COUNT_BITS: u32 = 6;

/// Largest used-bit count a bucket can carry
pub const MAX_USED_BITS: u8 = 58;

const COUNT_SHIFT: u32 = 64 - COUNT_BITS;
const COUNT_MASK: u64 = (1 << COUNT_BITS) - 1;

/// Bucket identifier errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketIdError {
    #[error("used bits {0} out of range (max 58)")]
    UsedBitsOutOfRange(u8),
    #[error("invalid bucket id: {0}")]
    Parse(String),
}

/// Bucket identifier
///
/// Ordering follows the bucket key (see [`BucketId::to_key`]): a bucket sorts
/// directly before its whole sub-tree, so every sub-tree is a contiguous range.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct BucketId {
    raw: u64,
}

fn low_mask(bits: u8) -> u64 {
    match bits {
        0 => 0,
        b if b >= 64 => u64::MAX,
        b => (1u64 << b) - 1,
    }
}

impl BucketId {
    /// Create a bucket from a used-bit count and an id; bits above
    /// `used_bits` are dropped.
    pub fn new(used_bits: u8, id: u64) -> Result<Self, BucketIdError> {
        if used_bits > MAX_USED_BITS {
            return Err(BucketIdError::UsedBitsOutOfRange(used_bits));
        }
        Ok(Self {
            raw: ((used_bits as u64) << COUNT_SHIFT) | (id & low_mask(used_bits)),
        })
    }

    /// Decode a raw value (count bits + prefix)
    pub fn from_raw(raw: u64) -> Result<Self, BucketIdError> {
        let used_bits = (raw >> COUNT_SHIFT) as u8;
        Self::new(used_bits, raw)
    }

    /// The root of the hierarchy (zero used bits)
    pub fn root() -> Self {
        Self { raw: 0 }
    }

    pub fn raw(&self) -> u64 {
        self.raw
    }

    pub fn used_bits(&self) -> u8 {
        (self.raw >> COUNT_SHIFT) as u8
    }

    /// Prefix bits without the count
    pub fn id(&self) -> u64 {
        self.raw & low_mask(self.used_bits())
    }

    /// Same prefix with a smaller used-bit count
    pub fn strip(&self, used_bits: u8) -> Option<Self> {
        if used_bits > self.used_bits() {
            return None;
        }
        Self::new(used_bits, self.id()).ok()
    }

    /// Whether `other` lies in the sub-tree rooted at this bucket
    pub fn contains(&self, other: &BucketId) -> bool {
        other.used_bits() >= self.used_bits()
            && (other.id() & low_mask(self.used_bits())) == self.id()
    }

    pub fn parent(&self) -> Option<Self> {
        let used = self.used_bits();
        if used == 0 {
            return None;
        }
        self.strip(used - 1)
    }

    /// The other child of this bucket's parent
    pub fn sibling(&self) -> Option<Self> {
        let used = self.used_bits();
        if used == 0 {
            return None;
        }
        Self::new(used, self.id() ^ (1u64 << (used - 1))).ok()
    }

    /// Both children, the one with the new bit cleared first
    pub fn children(&self) -> Option<[Self; 2]> {
        let used = self.used_bits();
        if used >= MAX_USED_BITS {
            return None;
        }
        let left = Self::new(used + 1, self.id()).ok()?;
        let right = Self::new(used + 1, self.id() | (1u64 << used)).ok()?;
        Some([left, right])
    }

    /// Bucket key: bit-reversed prefix with the used-bit count in the low
    /// six bits. Pre-order over the hierarchy, left child before right.
    pub fn to_key(&self) -> u64 {
        self.id().reverse_bits() | self.used_bits() as u64
    }

    pub fn from_key(key: u64) -> Result<Self, BucketIdError> {
        let used_bits = (key & COUNT_MASK) as u8;
        Self::new(used_bits, (key & !COUNT_MASK).reverse_bits())
    }
}

impl Ord for BucketId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_key().cmp(&other.to_key())
    }
}

impl PartialOrd for BucketId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl TryFrom<u64> for BucketId {
    type Error = BucketIdError;

    fn try_from(raw: u64) -> Result<Self, Self::Error> {
        Self::from_raw(raw)
    }
}

impl From<BucketId> for u64 {
    fn from(id: BucketId) -> Self {
        id.raw
    }
}

impl FromStr for BucketId {
    type Err = BucketIdError;

    /// Accepts the raw value as `0x`-prefixed hex or as decimal
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u64::from_str_radix(hex, 16),
            None => s.parse::<u64>(),
        }
        .map_err(|e| BucketIdError::Parse(format!("{}: {}", s, e)))?;
        Self::from_raw(raw)
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId(0x{:016x})", self.raw)
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BucketId({}:0x{:x})", self.used_bits(), self.id())
    }
}

/// Containment predicate between a bucket prefix and a candidate bucket
pub type ContainmentFn = fn(&BucketId, &BucketId) -> bool;

/// Bit-prefix containment: the candidate is in the prefix's sub-tree
pub fn prefix_contains(prefix: &BucketId, candidate: &BucketId) -> bool {
    prefix.contains(candidate)
}
