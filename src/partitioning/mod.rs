//! Partition affinity: which partitions this node owns at a topology.
//!
//! The demander consumes affinity through the [`Affinity`] trait only. It
//! needs two answers: the current topology version, and whether a partition
//! is assigned to the local node under a given version.

mod affinity;

pub use affinity::StaticAffinity;

use crate::types::{PartitionId, TopologyVersion};

/// Affinity contract consumed by the demander.
pub trait Affinity: Send + Sync + 'static {
    /// Latest topology version known locally.
    fn current_topology_version(&self) -> TopologyVersion;

    /// Whether `partition` is assigned to the local node at `topology`.
    fn is_locally_owned(&self, partition: PartitionId, topology: TopologyVersion) -> bool;

    /// Whether the topology has moved past `topology`.
    fn topology_changed(&self, topology: TopologyVersion) -> bool {
        self.current_topology_version() != topology
    }
}
