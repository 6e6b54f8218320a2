//! Collaborators shared by the demander and its helpers.

use crate::metrics::RebalanceMetrics;
use crate::network::Transport;
use crate::partitioning::Affinity;
use crate::rebalancing::events::{EventRecorder, NoopEventRecorder};
use crate::rebalancing::exchange::ExchangeManager;
use crate::storage::PartitionStore;
use crate::types::NodeId;
use std::fmt;
use std::sync::Arc;

/// Everything a demander needs from the rest of the node.
#[derive(Clone)]
pub struct RebalanceContext {
    pub local_node: NodeId,
    pub transport: Arc<dyn Transport>,
    pub store: Arc<dyn PartitionStore>,
    pub affinity: Arc<dyn Affinity>,
    pub exchange_manager: Arc<dyn ExchangeManager>,
    pub events: Arc<dyn EventRecorder>,
    pub metrics: Arc<RebalanceMetrics>,
}

impl RebalanceContext {
    /// Create a context with no event recording and fresh metrics.
    pub fn new(
        transport: Arc<dyn Transport>,
        store: Arc<dyn PartitionStore>,
        affinity: Arc<dyn Affinity>,
        exchange_manager: Arc<dyn ExchangeManager>,
    ) -> Self {
        Self {
            local_node: transport.local_node(),
            transport,
            store,
            affinity,
            exchange_manager,
            events: Arc::new(NoopEventRecorder),
            metrics: Arc::new(RebalanceMetrics::new()),
        }
    }

    /// Set the event recorder.
    pub fn with_events(mut self, events: Arc<dyn EventRecorder>) -> Self {
        self.events = events;
        self
    }

    /// Share an existing metrics instance.
    pub fn with_metrics(mut self, metrics: Arc<RebalanceMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

impl fmt::Debug for RebalanceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RebalanceContext")
            .field("local_node", &self.local_node)
            .finish_non_exhaustive()
    }
}
