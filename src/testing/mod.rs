//! Testing utilities for the rebalancing engine.
//!
//! Everything runs in one process: nodes talk through a shared
//! [`MemoryNetwork`], each node keeps its partitions in a
//! [`MemoryPartitionStore`], and affinity is a [`StaticAffinity`] table.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    RebalanceTestCluster                          │
//! │                                                                 │
//! │  ┌──────────────────┐    MemoryNetwork    ┌──────────────────┐ │
//! │  │   TestDemander   │ ◀────────────────▶  │   TestSupplier   │ │
//! │  │  - Demander      │   supply / demand   │  - paging        │ │
//! │  │  - store         │       topics        │  - class errors  │ │
//! │  │  - affinity      │                     │  - leaving       │ │
//! │  └──────────────────┘                     └──────────────────┘ │
//! │                                                                 │
//! │             RecordingExchangeManager (shared)                   │
//! └─────────────────────────────────────────────────────────────────┘
//! ```

mod supplier;
mod utils;

pub use supplier::TestSupplier;
pub(crate) use utils::wait_for;

use crate::config::RebalanceConfig;
use crate::network::MemoryNetwork;
use crate::partitioning::StaticAffinity;
use crate::rebalancing::{
    AssignmentPlan, Demander, DiscoveryEvent, DiscoveryEventKind, ExchangeHandle,
    ExchangeManager, MemoryEventRecorder, RebalanceContext, RoundSummary, WorkerRouter,
};
use crate::rebalancing::messages::EntryInfo;
use crate::storage::{MemoryPartitionStore, PartitionState};
use crate::types::{EntryVersion, NodeId, PartitionId, TopologyVersion};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Exchange manager that only counts what it was asked to do.
#[derive(Debug, Default)]
pub struct RecordingExchangeManager {
    preload: AtomicUsize,
    dummy: AtomicUsize,
    reassign: Mutex<Vec<bool>>,
}

impl RecordingExchangeManager {
    pub fn preload_calls(&self) -> usize {
        self.preload.load(Ordering::SeqCst)
    }

    pub fn dummy_calls(&self) -> usize {
        self.dummy.load(Ordering::SeqCst)
    }

    /// `reassign` flags of the dummy exchanges, in call order.
    pub fn reassign_flags(&self) -> Vec<bool> {
        self.reassign.lock().clone()
    }
}

impl ExchangeManager for RecordingExchangeManager {
    fn force_preload_exchange(&self, _exchange: &ExchangeHandle) {
        self.preload.fetch_add(1, Ordering::SeqCst);
    }

    fn force_dummy_exchange(&self, reassign: bool, _exchange: &ExchangeHandle) {
        self.dummy.fetch_add(1, Ordering::SeqCst);
        self.reassign.lock().push(reassign);
    }
}

/// A demanding node and the local state it rebalances into.
pub struct TestDemander {
    pub node: NodeId,
    pub demander: Arc<Demander>,
    pub store: Arc<MemoryPartitionStore>,
    pub affinity: Arc<StaticAffinity>,
    pub events: Arc<MemoryEventRecorder>,
}

impl TestDemander {
    /// Wait for the current round, panicking after `timeout`.
    pub async fn wait_round(&self, timeout: Duration) -> RoundSummary {
        let future = self.demander.sync_future();
        tokio::time::timeout(timeout, future.wait())
            .await
            .unwrap_or_else(|_| panic!("round on node {} did not complete", self.node))
    }

    /// Partitions of this node in `state`.
    pub fn partitions_in(&self, state: PartitionState) -> Vec<PartitionId> {
        self.store.partitions_in(state).into_iter().collect()
    }
}

/// In-process cluster of demanders and suppliers.
pub struct RebalanceTestCluster {
    pub network: Arc<MemoryNetwork>,
    pub exchange_manager: Arc<RecordingExchangeManager>,
    topology: TopologyVersion,
}

impl RebalanceTestCluster {
    pub fn new(topology: TopologyVersion) -> Self {
        Self {
            network: MemoryNetwork::new(),
            exchange_manager: Arc::new(RecordingExchangeManager::default()),
            topology,
        }
    }

    pub fn topology(&self) -> TopologyVersion {
        self.topology
    }

    /// A finished exchange for the cluster topology, triggered by `node`.
    pub fn exchange(&self, node: NodeId) -> ExchangeHandle {
        ExchangeHandle::completed(
            self.topology,
            DiscoveryEvent::new(node, DiscoveryEventKind::NodeJoined),
        )
    }

    /// A plan pulling `partitions` from `supplier`.
    pub fn plan(
        &self,
        trigger: NodeId,
        supplier: NodeId,
        partitions: impl IntoIterator<Item = PartitionId>,
    ) -> AssignmentPlan {
        AssignmentPlan::new(self.exchange(trigger)).demand_from(supplier, partitions)
    }

    /// Start a supplier owning `partitions`, each holding `keys` entries.
    pub fn add_supplier(
        &self,
        node: NodeId,
        config: &RebalanceConfig,
        partitions: impl IntoIterator<Item = PartitionId>,
        keys: usize,
    ) -> Arc<TestSupplier> {
        let store = Arc::new(MemoryPartitionStore::new());
        for p in partitions {
            store.create_partition(p, PartitionState::Owning);
            for i in 0..keys {
                store.put(p, &test_entry(p, i, EntryVersion::new(1, 0)));
            }
        }

        let supplier = TestSupplier::new(
            self.network.transport(node),
            WorkerRouter::new(config.dataset_id, config.pool_size),
            store,
        );
        supplier
            .register()
            .unwrap_or_else(|e| panic!("failed to register supplier {}: {}", node, e));
        supplier
    }

    /// Start a demander for which `owned` are assigned and still `Moving`.
    pub fn add_demander(
        &self,
        node: NodeId,
        config: RebalanceConfig,
        owned: impl IntoIterator<Item = PartitionId> + Clone,
    ) -> TestDemander {
        let store = Arc::new(MemoryPartitionStore::new());
        store.create_partitions(owned.clone(), PartitionState::Moving);
        let affinity = Arc::new(StaticAffinity::new(self.topology, owned));
        let events = Arc::new(MemoryEventRecorder::all());

        let ctx = RebalanceContext::new(
            self.network.transport(node),
            store.clone(),
            affinity.clone(),
            self.exchange_manager.clone(),
        )
        .with_events(events.clone());

        let demander = Demander::new(config, ctx)
            .unwrap_or_else(|e| panic!("failed to start demander {}: {}", node, e));

        TestDemander {
            node,
            demander,
            store,
            affinity,
            events,
        }
    }
}

/// Entry `i` of partition `p`.
pub fn test_entry(p: PartitionId, i: usize, version: EntryVersion) -> EntryInfo {
    EntryInfo::new(
        format!("p{}-k{}", p, i),
        format!("value-{}-{}", p, i),
        version,
    )
}
