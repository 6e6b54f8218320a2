//! Core types used throughout the rebalancing engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Node identifier in the cluster.
pub type NodeId = u64;

/// Partition number in `[0, partition_count)`.
pub type PartitionId = u32;

/// Identifier of a partitioned dataset (cache).
pub type DatasetId = u32;

/// Index of a logical rebalance worker.
pub type WorkerId = usize;

/// A snapshot of cluster membership and partition assignment.
///
/// Versions are totally ordered: `major` advances on membership changes and
/// `minor` on assignment-only changes within the same membership.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TopologyVersion {
    /// Membership generation.
    pub major: u64,
    /// Assignment generation within the membership.
    pub minor: u32,
}

impl TopologyVersion {
    /// Create a new topology version.
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// The next membership generation.
    pub fn next_major(self) -> Self {
        Self::new(self.major + 1, 0)
    }

    /// The next assignment generation for the same membership.
    pub fn next_minor(self) -> Self {
        Self::new(self.major, self.minor + 1)
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Version of a single entry, used for "insert only if newer" writes.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct EntryVersion {
    /// Global update order.
    pub order: u64,
    /// Order of the node that produced the update, breaks ties.
    pub node_order: u32,
}

impl EntryVersion {
    /// Create a new entry version.
    pub const fn new(order: u64, node_order: u32) -> Self {
        Self { order, node_order }
    }
}

impl fmt::Display for EntryVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.order, self.node_order)
    }
}
