//! Affinity backed by explicit per-version assignments.

use super::Affinity;
use crate::types::{PartitionId, TopologyVersion};
use parking_lot::RwLock;
use std::collections::{BTreeMap, BTreeSet};

/// Affinity whose local assignments are set by hand, one set per topology
/// version.
///
/// A lookup at version `v` uses the assignment of the greatest version not
/// above `v`, so minor topology bumps keep the previous assignment unless a
/// new one was recorded.
#[derive(Debug)]
pub struct StaticAffinity {
    current: RwLock<TopologyVersion>,
    owned: RwLock<BTreeMap<TopologyVersion, BTreeSet<PartitionId>>>,
}

impl StaticAffinity {
    /// Create an affinity at `version` owning `partitions`.
    pub fn new(version: TopologyVersion, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        let mut owned = BTreeMap::new();
        owned.insert(version, partitions.into_iter().collect());
        Self {
            current: RwLock::new(version),
            owned: RwLock::new(owned),
        }
    }

    /// Record the local assignment for `version`.
    pub fn assign(&self, version: TopologyVersion, partitions: impl IntoIterator<Item = PartitionId>) {
        self.owned
            .write()
            .insert(version, partitions.into_iter().collect());
    }

    /// Move the current topology to `version`.
    pub fn advance(&self, version: TopologyVersion) {
        let mut current = self.current.write();
        if version > *current {
            *current = version;
        }
    }

    /// Partitions owned locally at `version`.
    pub fn owned_at(&self, version: TopologyVersion) -> BTreeSet<PartitionId> {
        self.owned
            .read()
            .range(..=version)
            .next_back()
            .map(|(_, parts)| parts.clone())
            .unwrap_or_default()
    }
}

impl Affinity for StaticAffinity {
    fn current_topology_version(&self) -> TopologyVersion {
        *self.current.read()
    }

    fn is_locally_owned(&self, partition: PartitionId, topology: TopologyVersion) -> bool {
        self.owned
            .read()
            .range(..=topology)
            .next_back()
            .map_or(false, |(_, parts)| parts.contains(&partition))
    }
}
