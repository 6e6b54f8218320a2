//! Per-round assignment plans.

use crate::rebalancing::exchange::ExchangeHandle;
use crate::rebalancing::messages::DemandMessage;
use crate::types::{NodeId, PartitionId, TopologyVersion};
use std::collections::btree_map;
use std::collections::{BTreeMap, BTreeSet};

/// Which partitions to fetch from which peer for one rebalance round.
///
/// Produced by the affinity calculator at the end of an exchange. A newer plan
/// always replaces an older one entirely.
#[derive(Debug, Clone)]
pub struct AssignmentPlan {
    demands: BTreeMap<NodeId, DemandMessage>,
    exchange: ExchangeHandle,
}

impl AssignmentPlan {
    /// Create an empty plan for an exchange.
    pub fn new(exchange: ExchangeHandle) -> Self {
        Self {
            demands: BTreeMap::new(),
            exchange,
        }
    }

    /// Request `partitions` from `node` at the exchange's topology.
    pub fn demand_from(mut self, node: NodeId, partitions: impl IntoIterator<Item = PartitionId>) -> Self {
        self.insert(node, partitions);
        self
    }

    /// Add `partitions` to the demand for `node`.
    pub fn insert(&mut self, node: NodeId, partitions: impl IntoIterator<Item = PartitionId>) {
        let topology = self.exchange.topology_version();
        self.demands
            .entry(node)
            .or_insert_with(|| DemandMessage::new(Vec::new(), topology))
            .partitions
            .extend(partitions);
    }

    /// The exchange this plan was computed for.
    pub fn exchange(&self) -> &ExchangeHandle {
        &self.exchange
    }

    /// Topology version of the plan.
    pub fn topology_version(&self) -> TopologyVersion {
        self.exchange.topology_version()
    }

    /// Demand for a node, if any.
    pub fn get(&self, node: NodeId) -> Option<&DemandMessage> {
        self.demands.get(&node)
    }

    /// Iterate over (node, demand) pairs in node order.
    pub fn iter(&self) -> btree_map::Iter<'_, NodeId, DemandMessage> {
        self.demands.iter()
    }

    /// Mutable iteration, used to stamp round-wide settings on every demand.
    pub fn iter_mut(&mut self) -> btree_map::IterMut<'_, NodeId, DemandMessage> {
        self.demands.iter_mut()
    }

    /// Nodes with a non-empty demand.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.demands
            .iter()
            .filter(|(_, d)| !d.partitions.is_empty())
            .map(|(node, _)| *node)
    }

    /// Every partition requested in the plan.
    pub fn partitions(&self) -> BTreeSet<PartitionId> {
        self.demands
            .values()
            .flat_map(|d| d.partitions.iter().copied())
            .collect()
    }

    /// Whether the plan requests nothing.
    pub fn is_empty(&self) -> bool {
        self.demands.values().all(|d| d.partitions.is_empty())
    }
}
