//! Completion tracking for a single rebalance round.
//!
//! A round registers, per supplying node, the partitions still outstanding.
//! Worker handlers drain those sets as pages arrive; when every set is empty
//! the round completes exactly once. Partitions a supplier reported as missing
//! are collected along the way and, on completion, trigger a forced exchange so
//! that they are reassigned in a later round.

use crate::rebalancing::completion::Completion;
use crate::rebalancing::exchange::{ExchangeHandle, ExchangeManager};
use crate::types::{NodeId, PartitionId, TopologyVersion};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Outcome of a finished round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundSummary {
    /// Partitions that must be retried in a later round.
    pub missed: BTreeSet<PartitionId>,
    /// Nodes whose streams were cancelled.
    pub cancelled: BTreeSet<NodeId>,
}

impl RoundSummary {
    /// Whether every requested partition arrived.
    pub fn is_clean(&self) -> bool {
        self.missed.is_empty() && self.cancelled.is_empty()
    }
}

#[derive(Default)]
struct RoundState {
    topology_version: Option<TopologyVersion>,
    exchange: Option<ExchangeHandle>,
    attached: bool,
    done: bool,
    remaining: HashMap<NodeId, HashSet<PartitionId>>,
    missed: HashMap<NodeId, HashSet<PartitionId>>,
    cancelled: BTreeSet<NodeId>,
}

impl RoundState {
    /// Flip to done if nothing is outstanding, returning the summary.
    fn check_is_done(&mut self) -> Option<RoundSummary> {
        if self.done || !self.attached || !self.remaining.is_empty() {
            return None;
        }
        self.done = true;

        let missed = self
            .missed
            .drain()
            .flat_map(|(_, parts)| parts)
            .collect();

        Some(RoundSummary {
            missed,
            cancelled: std::mem::take(&mut self.cancelled),
        })
    }
}

/// Tracks outstanding and missed partitions of one rebalance round.
pub struct SyncFuture {
    round_id: Uuid,
    state: Mutex<RoundState>,
    completion: Completion<RoundSummary>,
    exchange_manager: Arc<dyn ExchangeManager>,
}

impl SyncFuture {
    /// Create a round that is not yet bound to a plan.
    pub fn new(exchange_manager: Arc<dyn ExchangeManager>) -> Self {
        Self {
            round_id: Uuid::new_v4(),
            state: Mutex::new(RoundState::default()),
            completion: Completion::new(),
            exchange_manager,
        }
    }

    /// Unique id of the round, for logs.
    pub fn round_id(&self) -> Uuid {
        self.round_id
    }

    /// Bind the round to the exchange whose plan it tracks.
    pub fn attach(&self, exchange: &ExchangeHandle) {
        let mut state = self.state.lock();
        state.topology_version = Some(exchange.topology_version());
        state.exchange = Some(exchange.clone());
        state.attached = true;
    }

    /// Whether the round has been bound to a plan.
    pub fn is_attached(&self) -> bool {
        self.state.lock().attached
    }

    /// Topology version of the plan, once attached.
    pub fn topology_version(&self) -> Option<TopologyVersion> {
        self.state.lock().topology_version
    }

    /// Register the partitions requested from `node`.
    pub fn append(&self, node: NodeId, partitions: impl IntoIterator<Item = PartitionId>) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        let partitions: HashSet<PartitionId> = partitions.into_iter().collect();
        if !partitions.is_empty() {
            state.remaining.insert(node, partitions);
        }
        state.missed.insert(node, HashSet::new());
    }

    /// `p` is no longer awaited from `node`.
    pub fn mark_partition_done(&self, node: NodeId, partition: PartitionId) {
        let summary = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }

            if let Some(parts) = state.remaining.get_mut(&node) {
                parts.remove(&partition);
                if parts.is_empty() {
                    state.remaining.remove(&node);
                    debug!(
                        round = %self.round_id,
                        node_id = node,
                        "Completed full partition iteration for node"
                    );
                }
            }

            state.check_is_done()
        };

        if let Some(summary) = summary {
            self.finish(summary);
        }
    }

    /// `p` could not be supplied by `node` and must be retried.
    pub fn mark_missed(&self, node: NodeId, partition: PartitionId) {
        let mut state = self.state.lock();
        if state.done {
            return;
        }
        state.missed.entry(node).or_default().insert(partition);
    }

    /// Stop waiting on `node` altogether.
    pub fn cancel(&self, node: NodeId) {
        let summary = {
            let mut state = self.state.lock();
            if state.done {
                return;
            }
            if state.remaining.remove(&node).is_some() {
                state.cancelled.insert(node);
            }
            state.check_is_done()
        };

        if let Some(summary) = summary {
            self.finish(summary);
        }
    }

    /// Complete the round without any outstanding work.
    pub fn complete(&self) {
        let summary = {
            let mut state = self.state.lock();
            state.attached = true;
            state.remaining.clear();
            state.check_is_done()
        };

        if let Some(summary) = summary {
            self.finish(summary);
        }
    }

    fn finish(&self, summary: RoundSummary) {
        debug!(round = %self.round_id, "Completed sync future");

        if !summary.missed.is_empty() {
            let exchange = self.state.lock().exchange.clone();
            if let Some(exchange) = exchange {
                debug!(
                    round = %self.round_id,
                    missed = ?summary.missed,
                    "Reassigning partitions that were missed"
                );
                self.exchange_manager.force_dummy_exchange(true, &exchange);
            }
        }

        self.completion.complete(summary);
    }

    /// Whether the round is done.
    pub fn is_done(&self) -> bool {
        self.completion.is_done()
    }

    /// Summary of a finished round.
    pub fn summary(&self) -> Option<RoundSummary> {
        self.completion.get()
    }

    /// Wait for the round to finish.
    pub async fn wait(&self) -> RoundSummary {
        self.completion.wait().await
    }

    /// Run `f` once the round finishes.
    pub fn on_done(&self, f: impl FnOnce(&RoundSummary) + Send + 'static) {
        self.completion.on_done(f);
    }

    /// Nodes still being waited on.
    pub fn remaining_nodes(&self) -> BTreeSet<NodeId> {
        self.state.lock().remaining.keys().copied().collect()
    }

    /// Partitions still outstanding from `node`.
    pub fn remaining_partitions(&self, node: NodeId) -> BTreeSet<PartitionId> {
        self.state
            .lock()
            .remaining
            .get(&node)
            .map(|parts| parts.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Missed partitions recorded so far, across nodes.
    pub fn missed(&self) -> BTreeSet<PartitionId> {
        if let Some(summary) = self.summary() {
            return summary.missed;
        }
        self.state
            .lock()
            .missed
            .values()
            .flat_map(|parts| parts.iter().copied())
            .collect()
    }
}

impl fmt::Debug for SyncFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("SyncFuture")
            .field("round_id", &self.round_id)
            .field("topology_version", &state.topology_version)
            .field("remaining_nodes", &state.remaining.len())
            .field("done", &state.done)
            .finish()
    }
}
